use super::{bearer_token, ok_response, RestError};
use actix_web::{web, HttpRequest, HttpResponse};
use labpool_agents::{core::session::service::SessionService, errors::SvcError};
use labpool_common::{now_ts, store::definitions::Store};

pub(super) fn configure<S: Store>(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("/v0/usage").route(web::get().to(get_usage::<S>)));
}

/// Usage summary for the authenticated owner's current month.
async fn get_usage<S: Store>(
    request: HttpRequest,
    service: web::Data<SessionService<S>>,
) -> Result<HttpResponse, RestError> {
    let token = bearer_token(&request);
    let claims = service
        .resolve_identity_claims(token.as_deref())?
        .ok_or(SvcError::TokenRequired)?;
    let stats = service
        .usage()
        .stats(
            &claims.user_id,
            claims.plan,
            claims.effective_quota_minutes(),
            now_ts(),
        )
        .await?;
    Ok(ok_response(stats, "Usage retrieved"))
}
