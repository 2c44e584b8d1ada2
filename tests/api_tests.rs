use std::sync::Arc;
use std::time::{Duration, Instant};

use actix_web::{App, test, web};
use rgpio::{AppConfig, AppState, MockGpioBackend, Session};
use serde_json::Value;

fn sample_config() -> AppConfig {
    serde_json::from_str(
        r#"
        {
            "http": {
                "host": "localhost:8080",
                "path": "/api/v1"
            },
            "chip": 0,
            "warnings": false,
            "broadcast_capacity": 16
        }
        "#,
    )
    .expect("valid sample config")
}

fn sample_state() -> (AppState<MockGpioBackend>, MockGpioBackend, String) {
    let cfg = Arc::new(sample_config());
    let backend = MockGpioBackend::default();
    let session = Arc::new(
        Session::new(cfg.clone(), Arc::new(backend.clone())).expect("session starts"),
    );
    (AppState::new(session), backend, cfg.http.path.clone())
}

#[actix_rt::test]
async fn mode_starts_unset_and_can_be_set() {
    let (state, _, scope_path) = sample_state();
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state.clone()))
            .service(state.api_scope(&scope_path)),
    )
    .await;

    let req = test::TestRequest::get().uri("/api/v1/mode").to_request();
    let resp: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(resp["mode"], "unset");

    let req = test::TestRequest::post()
        .uri("/api/v1/mode")
        .set_payload(r#"{"mode":"board"}"#)
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());

    let req = test::TestRequest::get().uri("/api/v1/mode").to_request();
    let resp: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(resp["mode"], "board");
}

#[actix_rt::test]
async fn conflicting_mode_returns_409() {
    let (state, _, scope_path) = sample_state();
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state.clone()))
            .service(state.api_scope(&scope_path)),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/api/v1/mode")
        .set_payload(r#"{"mode":"bcm"}"#)
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());

    let req = test::TestRequest::post()
        .uri("/api/v1/mode")
        .set_payload(r#"{"mode":"board"}"#)
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 409);

    let req = test::TestRequest::post()
        .uri("/api/v1/mode")
        .set_payload(r#"{"mode":"sideways"}"#)
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 400);
}

#[actix_rt::test]
async fn channel_before_mode_returns_409() {
    let (state, _, scope_path) = sample_state();
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state.clone()))
            .service(state.api_scope(&scope_path)),
    )
    .await;

    let req = test::TestRequest::get()
        .uri("/api/v1/gpio/11/value")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 409);
    let body: Value = test::read_body_json(resp).await;
    assert!(body["error"].as_str().unwrap().contains("numbering mode"));
}

#[actix_rt::test]
async fn invalid_channel_returns_404() {
    let (state, _, scope_path) = sample_state();
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state.clone()))
            .service(state.api_scope(&scope_path)),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/api/v1/mode")
        .set_payload(r#"{"mode":"board"}"#)
        .to_request();
    test::call_service(&app, req).await;

    // pin 1 is 3.3V
    let req = test::TestRequest::get()
        .uri("/api/v1/gpio/1/function")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 404);

    let req = test::TestRequest::get()
        .uri("/api/v1/gpio/abc/function")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 400);
}

#[actix_rt::test]
async fn wrong_method_returns_405() {
    let (state, _, scope_path) = sample_state();
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state.clone()))
            .service(state.api_scope(&scope_path)),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/api/v1/gpio/11/value")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 405);

    let req = test::TestRequest::get().uri("/api/v1/setup").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 405);
}

#[actix_rt::test]
async fn setup_output_and_read_back() {
    let (state, backend, scope_path) = sample_state();
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state.clone()))
            .service(state.api_scope(&scope_path)),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/api/v1/mode")
        .set_payload(r#"{"mode":"board"}"#)
        .to_request();
    test::call_service(&app, req).await;

    let req = test::TestRequest::post()
        .uri("/api/v1/setup")
        .set_payload(r#"{"channels":[11,13],"direction":"out","initial":false}"#)
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());

    let req = test::TestRequest::post()
        .uri("/api/v1/output")
        .set_payload(r#"{"channels":[11,13],"values":1}"#)
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());
    assert!(backend.level(17).unwrap());
    assert!(backend.level(27).unwrap());

    let req = test::TestRequest::get()
        .uri("/api/v1/gpio/11/value")
        .to_request();
    let body = test::call_and_read_body(&app, req).await;
    assert_eq!(body, "1");

    let req = test::TestRequest::get()
        .uri("/api/v1/gpio/11/function")
        .to_request();
    let resp: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(resp, "output");
}

#[actix_rt::test]
async fn output_count_mismatch_returns_400() {
    let (state, _, scope_path) = sample_state();
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state.clone()))
            .service(state.api_scope(&scope_path)),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/api/v1/mode")
        .set_payload(r#"{"mode":"logical"}"#)
        .to_request();
    test::call_service(&app, req).await;

    let req = test::TestRequest::post()
        .uri("/api/v1/setup")
        .set_payload(r#"{"channels":[17,18,27],"direction":"output"}"#)
        .to_request();
    test::call_service(&app, req).await;

    let req = test::TestRequest::post()
        .uri("/api/v1/output")
        .set_payload(r#"{"channels":[17,18,27],"values":[true,false]}"#)
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 400);
}

#[actix_rt::test]
async fn write_to_input_returns_409() {
    let (state, _, scope_path) = sample_state();
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state.clone()))
            .service(state.api_scope(&scope_path)),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/api/v1/mode")
        .set_payload(r#"{"mode":"logical"}"#)
        .to_request();
    test::call_service(&app, req).await;

    let req = test::TestRequest::post()
        .uri("/api/v1/setup")
        .set_payload(r#"{"channels":22,"direction":"in","pull":"up"}"#)
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());

    let req = test::TestRequest::post()
        .uri("/api/v1/output")
        .set_payload(r#"{"channels":22,"values":0}"#)
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 409);

    let req = test::TestRequest::get()
        .uri("/api/v1/gpio/22/value")
        .to_request();
    let body = test::call_and_read_body(&app, req).await;
    assert_eq!(body, "1");
}

#[actix_rt::test]
async fn setup_rejects_bad_payload() {
    let (state, _, scope_path) = sample_state();
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state.clone()))
            .service(state.api_scope(&scope_path)),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/api/v1/mode")
        .set_payload(r#"{"mode":"logical"}"#)
        .to_request();
    test::call_service(&app, req).await;

    let req = test::TestRequest::post()
        .uri("/api/v1/setup")
        .set_payload(r#"{"channels":"seventeen","direction":"in"}"#)
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 400);

    let req = test::TestRequest::post()
        .uri("/api/v1/setup")
        .set_payload(r#"{"channels":17,"direction":"out","pull":"up"}"#)
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 400);

    let req = test::TestRequest::post()
        .uri("/api/v1/setup")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 400);
}

#[actix_rt::test]
async fn wait_times_out_with_null_channel() {
    let (state, _, scope_path) = sample_state();
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state.clone()))
            .service(state.api_scope(&scope_path)),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/api/v1/mode")
        .set_payload(r#"{"mode":"logical"}"#)
        .to_request();
    test::call_service(&app, req).await;

    let req = test::TestRequest::post()
        .uri("/api/v1/setup")
        .set_payload(r#"{"channels":23,"direction":"in"}"#)
        .to_request();
    test::call_service(&app, req).await;

    let start = Instant::now();
    let req = test::TestRequest::post()
        .uri("/api/v1/gpio/23/wait")
        .set_payload(r#"{"edge":"rising","timeout":50}"#)
        .to_request();
    let resp: Value = test::call_and_read_body_json(&app, req).await;
    assert!(resp["channel"].is_null());
    assert!(start.elapsed() >= Duration::from_millis(40));

    let req = test::TestRequest::post()
        .uri("/api/v1/gpio/23/wait")
        .set_payload(r#"{"edge":"rising","timeout":0}"#)
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 400);
}

#[actix_rt::test]
async fn detect_and_poll_detected() {
    let (state, backend, scope_path) = sample_state();
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state.clone()))
            .service(state.api_scope(&scope_path)),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/api/v1/mode")
        .set_payload(r#"{"mode":"board"}"#)
        .to_request();
    test::call_service(&app, req).await;

    let req = test::TestRequest::post()
        .uri("/api/v1/setup")
        .set_payload(r#"{"channels":16,"direction":"in","pull":"down"}"#)
        .to_request();
    test::call_service(&app, req).await;

    let req = test::TestRequest::post()
        .uri("/api/v1/gpio/16/detect")
        .set_payload(r#"{"edge":"rising","bouncetime":-666}"#)
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());

    let req = test::TestRequest::post()
        .uri("/api/v1/gpio/16/detect")
        .set_payload(r#"{"edge":"falling"}"#)
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 409);

    // board pin 16 is line 23
    backend.drive(23, true).unwrap();

    let deadline = Instant::now() + Duration::from_secs(2);
    let mut detected = false;
    while !detected && Instant::now() < deadline {
        let req = test::TestRequest::get()
            .uri("/api/v1/gpio/16/detected")
            .to_request();
        let resp: Value = test::call_and_read_body_json(&app, req).await;
        detected = resp == true;
        if !detected {
            actix_rt::time::sleep(Duration::from_millis(5)).await;
        }
    }
    assert!(detected);

    let req = test::TestRequest::get()
        .uri("/api/v1/gpio/16/detected")
        .to_request();
    let resp: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(resp, false);

    let req = test::TestRequest::delete()
        .uri("/api/v1/gpio/16/detect")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());
}

#[actix_rt::test]
async fn pwm_lifecycle() {
    let (state, backend, scope_path) = sample_state();
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state.clone()))
            .service(state.api_scope(&scope_path)),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/api/v1/mode")
        .set_payload(r#"{"mode":"logical"}"#)
        .to_request();
    test::call_service(&app, req).await;

    let req = test::TestRequest::post()
        .uri("/api/v1/gpio/18/pwm")
        .set_payload(r#"{"frequency":50.0}"#)
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 409);

    let req = test::TestRequest::post()
        .uri("/api/v1/setup")
        .set_payload(r#"{"channels":18,"direction":"out"}"#)
        .to_request();
    test::call_service(&app, req).await;

    let req = test::TestRequest::post()
        .uri("/api/v1/gpio/18/pwm")
        .set_payload(r#"{"frequency":50.0}"#)
        .to_request();
    let resp: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(resp["line"], 18);
    assert_eq!(resp["running"], false);

    let req = test::TestRequest::post()
        .uri("/api/v1/gpio/18/pwm")
        .set_payload(r#"{"frequency":50.0}"#)
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 409);

    let req = test::TestRequest::post()
        .uri("/api/v1/gpio/18/pwm/start")
        .set_payload(r#"{"duty_cycle":100.0}"#)
        .to_request();
    let resp: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(resp["running"], true);

    let req = test::TestRequest::put()
        .uri("/api/v1/gpio/18/pwm/duty-cycle")
        .set_payload(r#"{"duty_cycle":150.0}"#)
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 400);

    let req = test::TestRequest::put()
        .uri("/api/v1/gpio/18/pwm/frequency")
        .set_payload(r#"{"frequency":200.0}"#)
        .to_request();
    let resp: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(resp["frequency"], 200.0);
    assert_eq!(resp["duty_cycle"], 100.0);

    let req = test::TestRequest::delete()
        .uri("/api/v1/gpio/18/pwm")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());
    assert!(!backend.level(18).unwrap());

    let req = test::TestRequest::get()
        .uri("/api/v1/gpio/18/pwm")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 409);
}

#[actix_rt::test]
async fn cleanup_closes_chip_and_resets_mode() {
    let (state, backend, scope_path) = sample_state();
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state.clone()))
            .service(state.api_scope(&scope_path)),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/api/v1/mode")
        .set_payload(r#"{"mode":"board"}"#)
        .to_request();
    test::call_service(&app, req).await;
    assert_eq!(backend.open_chips(), 1);
    assert_eq!(backend.last_opened(), Some(0));

    let req = test::TestRequest::post()
        .uri("/api/v1/setup")
        .set_payload(r#"{"channels":[11,12],"direction":"out","initial":true}"#)
        .to_request();
    test::call_service(&app, req).await;

    let req = test::TestRequest::post()
        .uri("/api/v1/cleanup")
        .set_payload(r#"{"channels":11}"#)
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());

    let req = test::TestRequest::get()
        .uri("/api/v1/gpio/11/value")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 409);

    let req = test::TestRequest::post().uri("/api/v1/cleanup").to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());
    assert_eq!(backend.open_chips(), 0);

    let req = test::TestRequest::get().uri("/api/v1/mode").to_request();
    let resp: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(resp["mode"], "unset");
}

#[actix_rt::test]
async fn board_info_uses_revision_override() {
    // only this test reads the revision; the others configure the chip directly
    unsafe { std::env::set_var("RGPIO_REVISION", "c03111") };

    let (state, _, scope_path) = sample_state();
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state.clone()))
            .service(state.api_scope(&scope_path)),
    )
    .await;

    let req = test::TestRequest::get().uri("/api/v1/info").to_request();
    let resp: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(resp["revision"], "c03111");
    assert_eq!(resp["model"], "Pi 4 Model B");
    assert_eq!(resp["processor"], "BCM2711");
    assert_eq!(resp["p1_revision"], 3);

    let req = test::TestRequest::post().uri("/api/v1/info").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 405);
}
