//! User profile lookups.
//!
//! Views ask for one user at a time; [`UserApi`] turns those asks into
//! batched `getUserInfoList` calls and caches what comes back.

use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use futures_timer::Delay;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::batch::{next_turn, BatchController, BatchRules};
use crate::cache::CachedRequest;
use crate::config::ClientSettings;
use crate::data::{KeySet, KeyedEntry, OnDuplicate, ValueSet};
use crate::error::ApiError;
use crate::transport::Transport;

const USER_INFO_LIST_PATH: &str = "/api/user/getUserInfoList";
const CHECK_TOKEN_VALID_PATH: &str = "/api/user/checkTokenValid";

/// Id of the built-in system user, which exists on every server and is never
/// fetched.
pub const SYSTEM_USERID: &str = "000000000000000000000000";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserBaseInfo {
    #[serde(rename = "_id")]
    pub id: String,
    pub email: String,
    pub nickname: String,
    pub discriminator: String,
    pub avatar: Option<String>,
    #[serde(default)]
    pub temporary: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<Map<String, Value>>,
}

impl KeyedEntry<str> for UserBaseInfo {
    fn get_key(&self) -> &str {
        &self.id
    }
}

/// Users that are answered locally rather than asked of the server.
pub fn builtin_user_info(user_id: &str) -> Option<UserBaseInfo> {
    match user_id {
        SYSTEM_USERID => Some(UserBaseInfo {
            id: SYSTEM_USERID.to_owned(),
            email: "admin@msgbyte.com".to_owned(),
            nickname: "System".to_owned(),
            discriminator: "0000".to_owned(),
            avatar: None,
            temporary: false,
            extra: None,
        }),
        _ => None,
    }
}

/// Replace the `{BACKEND}` placeholder the server uses in stored URLs.
pub fn parse_url_str(url: &str, service_url: &str) -> String {
    url.replace("{BACKEND}", service_url)
}

type UserBatchFuture = BoxFuture<'static, Result<ValueSet<UserBaseInfo>, ApiError>>;
type UserBatcher = Box<dyn Fn(KeySet<String>) -> UserBatchFuture + Send + Sync>;
type Window = BoxFuture<'static, ()>;
type WindowFn = Box<dyn Fn() -> Window + Send + Sync>;

/// The batch controller behind [`UserApi::fetch_user_info`].
pub type UserLoader =
    BatchController<String, UserBaseInfo, ApiError, UserBatchFuture, UserBatcher, Window, WindowFn>;

type TokenCheck = Box<dyn Fn(String) -> BoxFuture<'static, Result<bool, ApiError>> + Send + Sync>;

pub struct UserApi {
    users: UserLoader,
    token_valid: CachedRequest<String, bool, ApiError, TokenCheck>,
    service_url: String,
}

impl Debug for UserApi {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserApi")
            .field("users", &self.users)
            .field("token_valid", &self.token_valid)
            .field("service_url", &self.service_url)
            .finish()
    }
}

impl UserApi {
    pub fn new(transport: Arc<dyn Transport>, settings: &ClientSettings) -> Self {
        let batch_transport = Arc::clone(&transport);
        let batcher: UserBatcher = Box::new(move |user_ids: KeySet<String>| {
            let ids: Vec<&String> = user_ids.keys().collect();

            // POST rather than GET so that a big batch can't overflow the URL
            let request = batch_transport.post(USER_INFO_LIST_PATH, json!({ "userIds": ids }));

            async move {
                let data = request.await?;
                let users: Vec<Option<UserBaseInfo>> = serde_json::from_value(data)
                    .map_err(|err| ApiError::decode(USER_INFO_LIST_PATH, err))?;

                Ok(user_ids.values_from_iter(OnDuplicate::Ignore, users.into_iter().flatten()))
            }
            .boxed()
        });

        let window = settings.batch_window;
        let window: WindowFn = if window.is_zero() {
            Box::new(|| next_turn().boxed())
        } else {
            Box::new(move || Delay::new(window).boxed())
        };

        let users = BatchController::new(BatchRules {
            batcher,
            window,
            max_keys: settings.max_batch_keys,
            cache: settings.cache_user_info,
        });

        let check: TokenCheck = Box::new(move |token: String| {
            let request = transport.post(CHECK_TOKEN_VALID_PATH, json!({ "token": token }));

            async move {
                let data = request.await?;
                serde_json::from_value(data).map_err(|err| ApiError::decode(CHECK_TOKEN_VALID_PATH, err))
            }
            .boxed()
        });

        Self {
            users,
            token_valid: CachedRequest::new("tokenValid", check),
            service_url: settings.service_url.clone(),
        }
    }

    pub fn user_loader(&self) -> &UserLoader {
        &self.users
    }

    /// Basic profile of a user. `Ok(None)` means the server doesn't know
    /// this user.
    pub async fn fetch_user_info(&self, user_id: &str) -> Result<Option<UserBaseInfo>, ApiError> {
        if let Some(user) = builtin_user_info(user_id) {
            return Ok(Some(user));
        }

        let user = self.users.load(user_id.to_owned()).await.map_err(|err| {
            tracing::warn!(user_id, error = %err, "user info batch failed");
            err
        })?;

        Ok(user.map(|mut user| {
            if let Some(avatar) = user.avatar.as_deref() {
                user.avatar = Some(parse_url_str(avatar, &self.service_url));
            }
            user
        }))
    }

    /// Whether the server still accepts `token`. Answers are cached for the
    /// life of the process.
    pub async fn check_token_valid(&self, token: &str) -> Result<bool, ApiError> {
        self.token_valid.call(token.to_owned()).await
    }
}
