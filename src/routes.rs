use log::warn;
use std::sync::Arc;

use actix_web::{HttpRequest, HttpResponse, Responder, guard, http::Method, web};
use actix_ws::{Message, MessageStream, Session as WsSession};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::broadcast;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;

use crate::board::BoardInfo;
use crate::error::GpioError;
use crate::gpio::{Direction, Edge, EdgeEvent, GpioBackend, Pull};
use crate::mapper::{ChannelList, Levels, NumberingMode};
use crate::pwm::PwmHandle;
use crate::session::Session;

type PwmMap<B> = Arc<Mutex<FxHashMap<i64, PwmHandle<<B as GpioBackend>::Chip>>>>;

pub struct AppState<B: GpioBackend> {
    pub session: Arc<Session<B>>,
    pwms: PwmMap<B>,
}

impl<B: GpioBackend> AppState<B> {
    pub fn new(session: Arc<Session<B>>) -> Self {
        Self {
            session,
            pwms: Arc::new(Mutex::new(FxHashMap::default())),
        }
    }
}

impl<B: GpioBackend> Clone for AppState<B> {
    fn clone(&self) -> Self {
        Self {
            session: Arc::clone(&self.session),
            pwms: Arc::clone(&self.pwms),
        }
    }
}

#[derive(Deserialize)]
struct SetupPayload {
    channels: Value,
    direction: Direction,
    pull: Option<Pull>,
    initial: Option<bool>,
}

#[derive(Deserialize)]
struct OutputPayload {
    channels: Value,
    values: Value,
}

#[derive(Deserialize, Default)]
struct CleanupPayload {
    channels: Option<Value>,
}

#[derive(Deserialize)]
struct WarningsPayload {
    enabled: bool,
}

#[derive(Deserialize)]
struct WaitPayload {
    edge: Edge,
    bouncetime: Option<i64>,
    timeout: Option<i64>,
}

#[derive(Deserialize)]
struct DetectPayload {
    edge: Edge,
    bouncetime: Option<i64>,
}

#[derive(Deserialize)]
struct FrequencyPayload {
    frequency: f64,
}

#[derive(Deserialize)]
struct DutyCyclePayload {
    duty_cycle: f64,
}

#[derive(Serialize)]
struct PwmStatus {
    line: u32,
    frequency: f64,
    duty_cycle: f64,
    running: bool,
}

async fn handle_event_websocket(
    mut session: WsSession,
    mut client_stream: MessageStream,
    rx: broadcast::Receiver<EdgeEvent>,
    line_filter: Option<u32>,
) {
    let mut events = BroadcastStream::new(rx);

    loop {
        tokio::select! {
            msg = client_stream.recv() => {
                let Some(msg) = msg else { break; };

                match msg {
                    Ok(Message::Ping(bytes)) => {
                        let _ = session.pong(&bytes).await;
                    }
                    Ok(Message::Close(reason)) => {
                        let _ = session.close(reason).await;
                        break;
                    }
                    Ok(Message::Text(_))
                    | Ok(Message::Binary(_))
                    | Ok(Message::Pong(_))
                    | Ok(Message::Continuation(_))
                    | Ok(Message::Nop) => {}
                    Err(_) => break,
                }
            }
            event = events.next() => {
                let Some(event) = event else { break; };

                match event {
                    Ok(event) => {
                        if line_filter.is_none_or(|l| l == event.line)
                            && let Ok(text) = serde_json::to_string(&event)
                            && session.text(text).await.is_err()
                        {
                            warn!("WebSocket client disconnected");
                            break;
                        }
                    }
                    Err(BroadcastStreamRecvError::Lagged(n)) => {
                        let notice = GpioError::Gpio(format!("Event stream lagged by {n} messages"));
                        if session.text(notice.to_string()).await.is_err() {
                            warn!("WebSocket client lagged and disconnected");
                            break;
                        }
                    }
                }
            }
        }
    }
}

fn resource(path: &str, allowed: &[Method]) -> actix_web::Resource {
    web::resource(path).route(
        web::route()
            .guard(guard_not_methods(allowed))
            .to(method_not_allowed),
    )
}

impl<B: GpioBackend> AppState<B> {
    pub fn api_scope(&self, base_path: &str) -> actix_web::Scope {
        web::scope(base_path)
            .service(
                resource("/mode", &[Method::GET, Method::POST])
                    .route(web::get().to(get_mode::<B>))
                    .route(web::post().to(set_mode::<B>)),
            )
            .service(resource("/info", &[Method::GET]).route(web::get().to(get_info)))
            .service(resource("/warnings", &[Method::POST]).route(web::post().to(set_warnings::<B>)))
            .service(resource("/setup", &[Method::POST]).route(web::post().to(setup::<B>)))
            .service(resource("/output", &[Method::POST]).route(web::post().to(output::<B>)))
            .service(resource("/cleanup", &[Method::POST]).route(web::post().to(cleanup::<B>)))
            .service(resource("/events", &[Method::GET]).route(web::get().to(events_ws_all::<B>)))
            .service(
                resource("/gpio/{channel}/value", &[Method::GET])
                    .route(web::get().to(get_value::<B>)),
            )
            .service(
                resource("/gpio/{channel}/function", &[Method::GET])
                    .route(web::get().to(get_function::<B>)),
            )
            .service(
                resource("/gpio/{channel}/wait", &[Method::POST])
                    .route(web::post().to(wait_for_edge::<B>)),
            )
            .service(
                resource("/gpio/{channel}/detect", &[Method::POST, Method::DELETE])
                    .route(web::post().to(add_detect::<B>))
                    .route(web::delete().to(remove_detect::<B>)),
            )
            .service(
                resource("/gpio/{channel}/detected", &[Method::GET])
                    .route(web::get().to(get_detected::<B>)),
            )
            .service(
                resource("/gpio/{channel}/events", &[Method::GET])
                    .route(web::get().to(events_ws_channel::<B>)),
            )
            .service(
                resource(
                    "/gpio/{channel}/pwm",
                    &[Method::GET, Method::POST, Method::DELETE],
                )
                .route(web::get().to(pwm_status::<B>))
                .route(web::post().to(pwm_create::<B>))
                .route(web::delete().to(pwm_delete::<B>)),
            )
            .service(
                resource("/gpio/{channel}/pwm/start", &[Method::POST])
                    .route(web::post().to(pwm_start::<B>)),
            )
            .service(
                resource("/gpio/{channel}/pwm/stop", &[Method::POST])
                    .route(web::post().to(pwm_stop::<B>)),
            )
            .service(
                resource("/gpio/{channel}/pwm/duty-cycle", &[Method::PUT])
                    .route(web::put().to(pwm_duty_cycle::<B>)),
            )
            .service(
                resource("/gpio/{channel}/pwm/frequency", &[Method::PUT])
                    .route(web::put().to(pwm_frequency::<B>)),
            )
    }
}

async fn get_info() -> Result<impl Responder, GpioError> {
    Ok(web::Json(BoardInfo::detect()?))
}

async fn get_mode<B: GpioBackend>(state: web::Data<AppState<B>>) -> impl Responder {
    web::Json(json!({ "mode": state.session.mode() }))
}

async fn set_mode<B: GpioBackend>(
    body: web::Bytes,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, GpioError> {
    let payload: Value = parse_payload(&body)?;
    let mode: NumberingMode = serde_json::from_value(payload["mode"].clone())
        .map_err(|e| GpioError::InvalidMode(format!("{e}")))?;

    state.session.set_mode(mode)?;

    Ok(web::Json(json!({ "mode": mode })))
}

async fn set_warnings<B: GpioBackend>(
    body: web::Bytes,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, GpioError> {
    let payload: WarningsPayload = parse_payload(&body)?;
    state.session.set_warnings(payload.enabled);

    Ok(HttpResponse::Ok())
}

async fn setup<B: GpioBackend>(
    body: web::Bytes,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, GpioError> {
    let payload: SetupPayload = parse_payload(&body)?;
    let channels = ChannelList::try_from(&payload.channels)?;

    state
        .session
        .setup(channels, payload.direction, payload.pull, payload.initial)?;

    Ok(HttpResponse::Ok())
}

async fn output<B: GpioBackend>(
    body: web::Bytes,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, GpioError> {
    let payload: OutputPayload = parse_payload(&body)?;
    let channels = ChannelList::try_from(&payload.channels)?;
    let values = Levels::try_from(&payload.values)?;

    state.session.output(channels, values)?;

    Ok(HttpResponse::Ok())
}

async fn cleanup<B: GpioBackend>(
    body: web::Bytes,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, GpioError> {
    let payload: CleanupPayload = if body.is_empty() {
        CleanupPayload::default()
    } else {
        parse_payload(&body)?
    };
    let channels = payload
        .channels
        .as_ref()
        .map(ChannelList::try_from)
        .transpose()?;

    if channels.is_none() {
        state.pwms.lock().clear();
    }
    state.session.cleanup(channels)?;

    Ok(HttpResponse::Ok())
}

async fn get_value<B: GpioBackend>(
    req: HttpRequest,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, GpioError> {
    let channel = parse_channel(&req)?;
    let value = state.session.input(channel)?;

    Ok(web::Json(u8::from(value)))
}

async fn get_function<B: GpioBackend>(
    req: HttpRequest,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, GpioError> {
    let channel = parse_channel(&req)?;
    let function = state.session.function(channel)?;

    Ok(web::Json(function))
}

async fn wait_for_edge<B: GpioBackend>(
    req: HttpRequest,
    body: web::Bytes,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, GpioError> {
    let channel = parse_channel(&req)?;
    let payload: WaitPayload = parse_payload(&body)?;
    let session = state.session.clone();

    let result = web::block(move || {
        session.wait_for_edge(channel, payload.edge, payload.bouncetime, payload.timeout)
    })
    .await
    .map_err(|e| GpioError::Gpio(format!("wait for edge: {e}")))??;

    Ok(web::Json(json!({ "channel": result })))
}

async fn add_detect<B: GpioBackend>(
    req: HttpRequest,
    body: web::Bytes,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, GpioError> {
    let channel = parse_channel(&req)?;
    let payload: DetectPayload = parse_payload(&body)?;

    state
        .session
        .add_event_detect(channel, payload.edge, None, payload.bouncetime)?;

    Ok(HttpResponse::Ok())
}

async fn remove_detect<B: GpioBackend>(
    req: HttpRequest,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, GpioError> {
    let channel = parse_channel(&req)?;
    state.session.remove_event_detect(channel)?;

    Ok(HttpResponse::Ok())
}

async fn get_detected<B: GpioBackend>(
    req: HttpRequest,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, GpioError> {
    let channel = parse_channel(&req)?;
    let detected = state.session.event_detected(channel)?;

    Ok(web::Json(detected))
}

fn no_pwm(channel: i64) -> GpioError {
    GpioError::NotClaimed(format!("no PWM has been created for channel {channel}"))
}

fn with_pwm<B: GpioBackend, T>(
    state: &AppState<B>,
    channel: i64,
    f: impl FnOnce(&mut PwmHandle<B::Chip>) -> Result<T, GpioError>,
) -> Result<T, GpioError> {
    let mut pwms = state.pwms.lock();
    let pwm = pwms.get_mut(&channel).ok_or_else(|| no_pwm(channel))?;
    f(pwm)
}

fn pwm_status_of<C: crate::gpio::GpioChip>(pwm: &PwmHandle<C>) -> PwmStatus {
    PwmStatus {
        line: pwm.line(),
        frequency: pwm.frequency(),
        duty_cycle: pwm.duty_cycle(),
        running: pwm.is_running(),
    }
}

async fn pwm_status<B: GpioBackend>(
    req: HttpRequest,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, GpioError> {
    let channel = parse_channel(&req)?;
    let status = with_pwm(state.get_ref(), channel, |pwm| Ok(pwm_status_of(pwm)))?;

    Ok(web::Json(status))
}

async fn pwm_create<B: GpioBackend>(
    req: HttpRequest,
    body: web::Bytes,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, GpioError> {
    let channel = parse_channel(&req)?;
    let payload: FrequencyPayload = parse_payload(&body)?;

    let pwm = state.session.pwm(channel, payload.frequency)?;
    let status = pwm_status_of(&pwm);
    state.pwms.lock().insert(channel, pwm);

    Ok(web::Json(status))
}

async fn pwm_delete<B: GpioBackend>(
    req: HttpRequest,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, GpioError> {
    let channel = parse_channel(&req)?;
    let pwm = state.pwms.lock().remove(&channel).ok_or_else(|| no_pwm(channel))?;
    drop(pwm);

    Ok(HttpResponse::Ok())
}

async fn pwm_start<B: GpioBackend>(
    req: HttpRequest,
    body: web::Bytes,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, GpioError> {
    let channel = parse_channel(&req)?;
    let payload: DutyCyclePayload = parse_payload(&body)?;
    let status = with_pwm(state.get_ref(), channel, |pwm| {
        pwm.start(payload.duty_cycle)?;
        Ok(pwm_status_of(pwm))
    })?;

    Ok(web::Json(status))
}

async fn pwm_stop<B: GpioBackend>(
    req: HttpRequest,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, GpioError> {
    let channel = parse_channel(&req)?;
    let status = with_pwm(state.get_ref(), channel, |pwm| {
        pwm.stop();
        Ok(pwm_status_of(pwm))
    })?;

    Ok(web::Json(status))
}

async fn pwm_duty_cycle<B: GpioBackend>(
    req: HttpRequest,
    body: web::Bytes,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, GpioError> {
    let channel = parse_channel(&req)?;
    let payload: DutyCyclePayload = parse_payload(&body)?;
    let status = with_pwm(state.get_ref(), channel, |pwm| {
        pwm.change_duty_cycle(payload.duty_cycle)?;
        Ok(pwm_status_of(pwm))
    })?;

    Ok(web::Json(status))
}

async fn pwm_frequency<B: GpioBackend>(
    req: HttpRequest,
    body: web::Bytes,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, GpioError> {
    let channel = parse_channel(&req)?;
    let payload: FrequencyPayload = parse_payload(&body)?;
    let status = with_pwm(state.get_ref(), channel, |pwm| {
        pwm.change_frequency(payload.frequency)?;
        Ok(pwm_status_of(pwm))
    })?;

    Ok(web::Json(status))
}

async fn events_ws_all<B: GpioBackend>(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState<B>>,
) -> Result<HttpResponse, GpioError> {
    open_event_socket(&req, stream, &state, None)
}

async fn events_ws_channel<B: GpioBackend>(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState<B>>,
) -> Result<HttpResponse, GpioError> {
    let channel = parse_channel(&req)?;
    let line = state.session.mapper().to_line(channel)?;
    open_event_socket(&req, stream, &state, Some(line))
}

fn open_event_socket<B: GpioBackend>(
    req: &HttpRequest,
    stream: web::Payload,
    state: &AppState<B>,
    line_filter: Option<u32>,
) -> Result<HttpResponse, GpioError> {
    let rx = state.session.subscribe_events();
    let (response, session, client_stream) = actix_ws::handle(req, stream)
        .map_err(|e| GpioError::Gpio(format!("Websocket error: {e}")))?;

    actix_web::rt::spawn(async move {
        handle_event_websocket(session, client_stream, rx, line_filter).await;
    });

    Ok(response)
}

fn parse_payload<T: DeserializeOwned>(body: &[u8]) -> Result<T, GpioError> {
    if body.is_empty() {
        return Err(GpioError::InvalidArgument("Empty payload".into()));
    }

    serde_json::from_slice(body)
        .map_err(|e| GpioError::InvalidArgument(format!("Invalid payload: {e}")))
}

fn parse_channel(req: &HttpRequest) -> Result<i64, GpioError> {
    let channel = req
        .match_info()
        .get("channel")
        .ok_or_else(|| GpioError::InvalidArgument("Missing channel".into()))?;
    let channel = channel
        .parse::<i64>()
        .map_err(|_| GpioError::InvalidArgument("Channel must be an integer".into()))?;

    Ok(channel)
}

async fn method_not_allowed() -> HttpResponse {
    HttpResponse::MethodNotAllowed().finish()
}

fn guard_not_methods(methods: &[Method]) -> impl guard::Guard + use<> {
    let allowed: Vec<Method> = methods.to_vec();
    guard::fn_guard(move |ctx| !allowed.iter().any(|m| m == ctx.head().method))
}
