use reqwest::Method;
use serde_json::{Map, Value as JsonValue, json};

use crate::error::Error;
use crate::transport::RequestOptions;
use crate::types::UserId;
use crate::user::User;

/// Administrative user management (`/admin/users`).
///
/// Borrowed from an authenticated [`User`] via [`User::admin`]; every call
/// goes through the principal's authenticated request path, so the bearer
/// token, audience headers and error-message rules apply uniformly. The
/// service rejects these calls unless the principal has an admin role.
pub struct AdminClient<'a> {
    user: &'a User,
}

impl<'a> AdminClient<'a> {
    pub(crate) fn new(user: &'a User) -> Self {
        Self { user }
    }

    fn user_path(id: &UserId) -> String {
        format!("/admin/users/{id}")
    }

    /// List users, optionally restricted to an audience.
    pub async fn list_users(&self, aud: Option<&str>) -> Result<JsonValue, Error> {
        let mut options = RequestOptions::new(Method::GET);
        if let Some(aud) = aud {
            options = options.audience(aud);
        }
        self.user.request("/admin/users", options).await
    }

    /// Fetch one user by id.
    pub async fn get_user(&self, id: &UserId) -> Result<JsonValue, Error> {
        self.user
            .request(&Self::user_path(id), RequestOptions::new(Method::GET))
            .await
    }

    /// Create a user with the given credentials and optional extra
    /// attributes (e.g. `{"confirm": true}`).
    pub async fn create_user(
        &self,
        email: &str,
        password: &str,
        attributes: Option<JsonValue>,
    ) -> Result<JsonValue, Error> {
        let mut body = match attributes {
            None => Map::new(),
            Some(JsonValue::Object(map)) => map,
            Some(_) => {
                return Err(Error::Request("user attributes must be a JSON object".into()));
            }
        };
        body.insert("email".into(), json!(email));
        body.insert("password".into(), json!(password));
        self.user
            .request(
                "/admin/users",
                RequestOptions::new(Method::POST).json(JsonValue::Object(body)),
            )
            .await
    }

    /// Update a user's attributes.
    pub async fn update_user(
        &self,
        id: &UserId,
        attributes: JsonValue,
    ) -> Result<JsonValue, Error> {
        self.user
            .request(
                &Self::user_path(id),
                RequestOptions::new(Method::PUT).json(attributes),
            )
            .await
    }

    /// Delete a user.
    pub async fn delete_user(&self, id: &UserId) -> Result<JsonValue, Error> {
        self.user
            .request(&Self::user_path(id), RequestOptions::new(Method::DELETE))
            .await
    }
}
