use actix_cors::Cors;
use actix_web::{
    dev::Server,
    http::{header, StatusCode},
    web::{self, Data},
    App, HttpResponse, HttpServer, ResponseError,
};
use common::req::{
    DoorControlRequest, DoorControlResponse, MessageResponse, ReadingResponse, ReportQuery,
};
use log::{debug, error, info, warn};

use crate::config::HttpConfig;
use crate::db::{RecordStore, StoreError};
use crate::dispatch::{CommandIntent, CommandPublisher, DispatchError, Dispatcher};
use crate::query::{QueryError, QueryService};

pub struct AppState<S, P> {
    pub queries: QueryService<S>,
    pub dispatcher: Dispatcher<P>,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Query(#[from] QueryError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Query(QueryError::NotFound) => StatusCode::NOT_FOUND,
            ApiError::Query(QueryError::Store(_)) | ApiError::Store(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ApiError::Dispatch(DispatchError::InvalidAction(_)) => StatusCode::BAD_REQUEST,
            ApiError::Dispatch(DispatchError::NotConnected) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Dispatch(DispatchError::TransmitFailed(_)) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn error_response(&self) -> HttpResponse {
        let mut res = HttpResponse::build(self.status_code());
        match self {
            ApiError::Query(QueryError::NotFound) => res.json(MessageResponse {
                message: self.to_string(),
            }),
            ApiError::Query(QueryError::Store(_)) | ApiError::Store(_) => {
                res.json(MessageResponse {
                    message: "Internal Server Error".to_string(),
                })
            }
            ApiError::Dispatch(err) => res.json(DoorControlResponse {
                success: false,
                message: err.to_string(),
            }),
        }
    }
}

async fn api_status<S: RecordStore, P: CommandPublisher>(
    state: Data<AppState<S, P>>,
) -> Result<web::Json<ReadingResponse>, ApiError> {
    let reading = state.queries.status().await.map_err(|err| {
        if let QueryError::Store(e) = &err {
            error!("Error fetching status: {e}");
        }
        err
    })?;
    debug!("Latest reading is #{}", reading.id);

    Ok(web::Json(reading.into()))
}

async fn api_report<S: RecordStore, P: CommandPublisher>(
    query: web::Query<ReportQuery>,
    state: Data<AppState<S, P>>,
) -> Result<web::Json<Vec<ReadingResponse>>, ApiError> {
    let readings = state
        .queries
        .report(query.timeframe.as_deref())
        .await
        .map_err(|err| {
            error!("Error fetching report: {err}");
            err
        })?;

    Ok(web::Json(readings.into_iter().map(Into::into).collect()))
}

async fn api_door_control<S: RecordStore, P: CommandPublisher>(
    body: web::Json<DoorControlRequest>,
    state: Data<AppState<S, P>>,
) -> Result<web::Json<DoorControlResponse>, ApiError> {
    let intent = CommandIntent {
        action: body.into_inner().action,
    };
    let ack = state.dispatcher.dispatch(intent).await.map_err(|err| {
        warn!("Door control rejected: {err} ({})", err.detail().unwrap_or("-"));
        err
    })?;

    Ok(web::Json(DoorControlResponse {
        success: true,
        message: ack.message(),
    }))
}

/// Registers the `/api` routes. `AppState<S, P>` must be in app data.
pub fn configure<S: RecordStore, P: CommandPublisher>(cfg: &mut web::ServiceConfig) {
    cfg.app_data(web::JsonConfig::default().error_handler(|err, _req| {
        // an unreadable body carries no valid action
        ApiError::Dispatch(DispatchError::InvalidAction(Some(err.to_string()))).into()
    }))
    .service(
        web::scope("/api")
            .route("/status", web::get().to(api_status::<S, P>))
            .route("/report", web::get().to(api_report::<S, P>))
            .route("/door/control", web::post().to(api_door_control::<S, P>)),
    );
}

pub fn new_http_server<S: RecordStore, P: CommandPublisher>(
    state: AppState<S, P>,
    config: &HttpConfig,
) -> std::io::Result<Server> {
    let state = Data::new(state);
    let cors_origin = config.cors_origin.clone();

    let server = HttpServer::new(move || {
        let cors = match &cors_origin {
            Some(origin) => Cors::default()
                .allowed_origin(origin)
                .allowed_methods(vec!["GET", "POST"])
                .allowed_headers(vec![header::AUTHORIZATION, header::ACCEPT])
                .allowed_header(header::CONTENT_TYPE)
                .max_age(3600),
            None => Cors::permissive(),
        };

        App::new()
            .app_data(state.clone())
            .configure(configure::<S, P>)
            .wrap(cors)
    })
    .bind((config.host.as_str(), config.port))?
    .run();

    info!("API Server listening on {}:{}", config.host, config.port);
    Ok(server)
}
