use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::Response,
};
use jsonwebtoken::{DecodingKey, Validation, decode};

use atrium_types::api::Claims;
use atrium_types::identity::Identity;

use crate::AppState;
use crate::error::ApiError;

/// Extract and validate the roster application's JWT from the
/// Authorization header, against the shared secret carried in app state.
/// The verified claims are attached as a request extension for handlers to
/// read.
pub async fn require_auth(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let auth_header = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or(ApiError::AuthFailed)?;

    let token = auth_header
        .strip_prefix("Bearer ")
        .ok_or(ApiError::AuthFailed)?;

    let token_data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(state.jwt_secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|_| ApiError::AuthFailed)?;

    req.extensions_mut().insert(token_data.claims);
    Ok(next.run(req).await)
}

/// The identity a set of claims acts as. `sub` arrives in whichever form
/// the roster application used when issuing the token.
pub fn claims_identity(claims: &Claims) -> Identity {
    Identity::from(claims.sub.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    use axum::{
        Extension, Router,
        body::Body,
        http::{Request as HttpRequest, StatusCode},
        middleware,
        routing::get,
    };
    use jsonwebtoken::{EncodingKey, Header, encode};
    use tower::ServiceExt;

    use atrium_gateway::Gateway;
    use atrium_store::Database;

    use crate::AppStateInner;

    async fn whoami(Extension(claims): Extension<Claims>) -> String {
        claims.sub
    }

    fn app(secret: &str) -> Router {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let state: AppState = Arc::new(AppStateInner {
            db: db.clone(),
            jwt_secret: secret.to_string(),
            gateway: Gateway::new(db),
        });
        Router::new()
            .route("/whoami", get(whoami))
            .layer(middleware::from_fn_with_state(state.clone(), require_auth))
            .with_state(state)
    }

    fn token(secret: &str) -> String {
        let claims = Claims {
            sub: "42".to_string(),
            username: "Olena".to_string(),
            exp: (chrono::Utc::now() + chrono::Duration::hours(1)).timestamp() as usize,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn secret_comes_from_state_not_the_environment() {
        // The process env never learns this secret; only app state does.
        let app = app("state-only-secret");

        let ok = app
            .clone()
            .oneshot(
                HttpRequest::builder()
                    .uri("/whoami")
                    .header("Authorization", format!("Bearer {}", token("state-only-secret")))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(ok.status(), StatusCode::OK);

        let forged = app
            .oneshot(
                HttpRequest::builder()
                    .uri("/whoami")
                    .header("Authorization", format!("Bearer {}", token("some-other-secret")))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(forged.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn missing_or_malformed_headers_are_rejected() {
        let app = app("s");

        let missing = app
            .clone()
            .oneshot(
                HttpRequest::builder()
                    .uri("/whoami")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);

        let malformed = app
            .oneshot(
                HttpRequest::builder()
                    .uri("/whoami")
                    .header("Authorization", "Basic not-a-bearer")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(malformed.status(), StatusCode::UNAUTHORIZED);
    }
}
