use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use conclave_core::{
    consumer_subject, room_subject, BusError, ChannelClass, ConsumerSpec, SYSTEM_WORKER_SUBJECT,
};

use crate::SessionContext;

/// The connection-authorization hook registered on the bus.
///
/// Every new client connection passes through [AuthCallout::handle], which
/// turns a session access token into a signed, least-privilege capability
/// token. Five durable consumers are provisioned as a side effect, one per
/// channel class, so re-running the callout for the same user is safe.
pub struct AuthCallout {
    context: SessionContext,
}

#[derive(Debug, Error)]
pub enum AuthError {
    /// The session access token did not verify or decode
    #[error("Invalid session access token: {0}")]
    InvalidToken(String),
    /// A durable consumer could not be provisioned, the whole request aborts
    #[error("Failed to provision {class} consumer: {source}")]
    Provisioning {
        class: &'static str,
        source: BusError,
    },
    #[error("Failed to sign capability token: {0}")]
    Signing(String),
}

/// An opaque authorization request as delivered by the bus's auth hook.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthorizationRequest {
    pub user_public_key: String,
    pub server_id: String,
    pub connect_options: ConnectOptions,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConnectOptions {
    pub session_access_token: String,
}

/// The response handed back to the bus. Failures carry an explicit error
/// message, the connection is rejected rather than silently downgraded.
#[derive(Debug, Clone, Serialize)]
pub struct AuthorizationResponse {
    pub audience: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jwt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Claims carried by the session access token issued by the core api
#[derive(Debug, Serialize, Deserialize)]
pub struct SessionTokenClaims {
    /// The user id
    pub sub: String,
    pub room_id: String,
    pub exp: usize,
}

/// The claim set signed into a capability token
#[derive(Debug, Serialize, Deserialize)]
pub struct CapabilityClaims {
    /// The connecting client's bus-level public key
    pub sub: String,
    /// The server the token is scoped to
    pub aud: String,
    pub room_id: String,
    pub user_id: String,
    pub allow_publish: Vec<String>,
    pub allow_subscribe: Vec<String>,
    pub exp: usize,
}

impl AuthCallout {
    pub fn new(context: &SessionContext) -> Self {
        Self {
            context: context.clone(),
        }
    }

    /// Handles one authorization request, returning a response with either a
    /// signed capability token or an explicit error.
    pub async fn handle(&self, request: AuthorizationRequest) -> AuthorizationResponse {
        match self.authorize(&request).await {
            Ok(jwt) => AuthorizationResponse {
                audience: request.server_id,
                jwt: Some(jwt),
                error: None,
            },
            Err(e) => {
                warn!("Rejecting bus connection: {e}");

                AuthorizationResponse {
                    audience: request.server_id,
                    jwt: None,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    async fn authorize(&self, request: &AuthorizationRequest) -> Result<String, AuthError> {
        let claims = self.verify_session_token(&request.connect_options.session_access_token)?;

        let room_id = claims.room_id;
        let user_id = claims.sub;

        self.provision_consumers(&room_id, &user_id).await?;

        let permissions = derive_permissions(&room_id, &user_id);
        debug!(
            "Granting {} publish and {} subscribe subjects to {}@{}",
            permissions.publish.len(),
            permissions.subscribe.len(),
            user_id,
            room_id
        );

        self.sign(request, &room_id, &user_id, permissions)
    }

    fn verify_session_token(&self, token: &str) -> Result<SessionTokenClaims, AuthError> {
        let key = DecodingKey::from_secret(self.context.config.api_secret.as_bytes());

        decode::<SessionTokenClaims>(token, &key, &Validation::default())
            .map(|data| data.claims)
            .map_err(|e| AuthError::InvalidToken(e.to_string()))
    }

    /// Creates or updates the five durable per-user consumers for this room
    async fn provision_consumers(&self, room_id: &str, user_id: &str) -> Result<(), AuthError> {
        for class in ChannelClass::ALL {
            let spec = ConsumerSpec {
                name: format!("{}:{}:{}", class.as_str(), room_id, user_id),
                filter_subjects: vec![class.subject(room_id, user_id)],
            };

            self.context
                .bus
                .ensure_consumer(spec)
                .await
                .map_err(|source| AuthError::Provisioning {
                    class: class.as_str(),
                    source,
                })?;
        }

        Ok(())
    }

    fn sign(
        &self,
        request: &AuthorizationRequest,
        room_id: &str,
        user_id: &str,
        permissions: Permissions,
    ) -> Result<String, AuthError> {
        let config = &self.context.config;

        let expires_at = chrono::Utc::now() + config.token_ttl();

        let claims = CapabilityClaims {
            sub: request.user_public_key.clone(),
            aud: request.server_id.clone(),
            room_id: room_id.to_string(),
            user_id: user_id.to_string(),
            allow_publish: permissions.publish,
            allow_subscribe: permissions.subscribe,
            exp: expires_at.timestamp() as usize,
        };

        let mut header = Header::default();
        header.kid = Some(config.issuer_key_id.clone());

        encode(
            &header,
            &claims,
            &EncodingKey::from_secret(config.issuer_secret.as_bytes()),
        )
        .map_err(|e| AuthError::Signing(e.to_string()))
    }
}

struct Permissions {
    publish: Vec<String>,
    subscribe: Vec<String>,
}

/// Computes the allow-list for one user: their own consumer subjects, their
/// own private subjects, the room's public subjects, and the shared system
/// worker ingress. Never another user's private subjects.
fn derive_permissions(room_id: &str, user_id: &str) -> Permissions {
    let mut publish = vec![];
    let mut subscribe = vec![consumer_subject(room_id, user_id)];

    for class in ChannelClass::ALL {
        let subject = class.subject(room_id, user_id);
        subscribe.push(subject.clone());

        if class.is_private() {
            // Only the user's own scoped subject, public writes go through
            // the room-wide subject below
            publish.push(subject);
        } else {
            publish.push(room_subject(room_id, class));
        }
    }

    publish.push(SYSTEM_WORKER_SUBJECT.to_string());

    Permissions { publish, subscribe }
}
