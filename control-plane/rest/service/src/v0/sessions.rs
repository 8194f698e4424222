use super::{bearer_token, ok_response, RestError};
use actix_web::{web, HttpRequest, HttpResponse};
use labpool_agents::core::session::{
    service::SessionService, CreateSessionBody, CreateSessionRequest, HeartbeatBody, TerminateBody,
};
use labpool_common::{store::definitions::Store, types::session::SessionId};

pub(super) fn configure<S: Store>(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::resource("/v0/sessions").route(web::post().to(create_session::<S>)),
    )
    .service(
        web::resource("/v0/sessions/{session_id}")
            .route(web::get().to(get_session::<S>))
            .route(web::delete().to(delete_session::<S>)),
    )
    .service(
        web::resource("/v0/sessions/{session_id}/heartbeat")
            .route(web::post().to(heartbeat::<S>)),
    )
    .service(
        web::resource("/v0/owners/{owner_id}/sessions")
            .route(web::get().to(owner_sessions::<S>)),
    );
}

async fn create_session<S: Store>(
    request: HttpRequest,
    service: web::Data<SessionService<S>>,
    body: Option<web::Json<CreateSessionBody>>,
) -> Result<HttpResponse, RestError> {
    let create = CreateSessionRequest {
        token: bearer_token(&request),
        body: body.map(|json| json.into_inner()).unwrap_or_default(),
    };
    let view = service.create_session(create).await?;
    let message = match (view.reused, view.status) {
        (Some(true), _) => "Existing session found",
        (_, labpool_common::types::session::SessionStatus::Ready) => {
            "Session created and ready"
        }
        _ => "Session created, workstation provisioning",
    };
    Ok(ok_response(view, message))
}

async fn get_session<S: Store>(
    service: web::Data<SessionService<S>>,
    path: web::Path<String>,
) -> Result<HttpResponse, RestError> {
    let session_id = SessionId::from(path.into_inner());
    let view = service.get_session(&session_id).await?;
    Ok(ok_response(view, "Session retrieved"))
}

async fn delete_session<S: Store>(
    service: web::Data<SessionService<S>>,
    path: web::Path<String>,
    body: Option<web::Json<TerminateBody>>,
) -> Result<HttpResponse, RestError> {
    let session_id = SessionId::from(path.into_inner());
    let view = service
        .delete_session(
            &session_id,
            body.map(|json| json.into_inner()).unwrap_or_default(),
        )
        .await?;
    Ok(ok_response(view, "Session terminated"))
}

async fn heartbeat<S: Store>(
    request: HttpRequest,
    service: web::Data<SessionService<S>>,
    path: web::Path<String>,
    body: Option<web::Json<HeartbeatBody>>,
) -> Result<HttpResponse, RestError> {
    let session_id = SessionId::from(path.into_inner());
    let token = bearer_token(&request);
    let view = service
        .heartbeat(
            &session_id,
            token.as_deref(),
            body.map(|json| json.into_inner()).unwrap_or_default(),
        )
        .await?;
    Ok(ok_response(view, "Heartbeat received"))
}

async fn owner_sessions<S: Store>(
    service: web::Data<SessionService<S>>,
    path: web::Path<String>,
) -> Result<HttpResponse, RestError> {
    let owner_id = path.into_inner();
    let view = service.sessions_for_owner(&owner_id).await?;
    let message = format!("Found {} active session(s)", view.active_sessions.len());
    Ok(ok_response(view, &message))
}
