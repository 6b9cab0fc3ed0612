use actix_web::{web, App, HttpResponse, HttpServer, Responder};
use log::{error, info};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;
use serde::Serialize;
use std::time::{SystemTime, UNIX_EPOCH};
use utoipa::ToSchema;

use crate::{config::ConfigBases, get_config_or_panic, CONFIG};
use crate::mqtt::{get_app_status, AppStatus, MqttConnectionStatus};


pub struct ApiManager;

#[derive(Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub mqtt: MqttHealthInfo,
    pub uptime_seconds: u64,
    pub timestamp: u64,
}

#[derive(Serialize, ToSchema)]
pub struct MqttHealthInfo {
    pub status: String,
    pub last_connected_ago_seconds: Option<u64>,
    pub last_message_sent_ago_seconds: Option<u64>,
    pub last_message_received_ago_seconds: Option<u64>,
    pub connection_attempts: u64,
}

#[derive(Serialize, ToSchema, Debug, PartialEq)]
pub struct DeviceInfo {
    pub name: String,
    pub protocol: Option<String>,
    pub status: String,
    pub reason: Option<String>,
    pub invalid_frames: u64,
    pub three_phase: Option<bool>,
    pub producer: Option<bool>,
    pub last_update: Option<u64>,
}

fn health_response(app_status: &AppStatus) -> (bool, HealthResponse) {
    let mqtt_health = &app_status.mqtt_health;
    let now = std::time::Instant::now();
    let system_time = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();

    // Calculate time differences
    let last_connected_ago = mqtt_health.last_connected
        .map(|t| now.duration_since(t).as_secs());
    let last_message_sent_ago = mqtt_health.last_message_sent
        .map(|t| now.duration_since(t).as_secs());
    let last_message_received_ago = mqtt_health.last_message_received
        .map(|t| now.duration_since(t).as_secs());

    let mqtt_status = match &mqtt_health.status {
        MqttConnectionStatus::Connected => "connected",
        MqttConnectionStatus::Disconnected => "disconnected",
        MqttConnectionStatus::Error(_) => "error",
    };

    // Meters send at least every few seconds, five minutes of silence means something is off
    let overall_healthy = matches!(mqtt_health.status, MqttConnectionStatus::Connected) &&
        last_message_sent_ago.unwrap_or(3600) < 300;

    let response = HealthResponse {
        status: if overall_healthy { "healthy".to_string() } else { "unhealthy".to_string() },
        mqtt: MqttHealthInfo {
            status: mqtt_status.to_string(),
            last_connected_ago_seconds: last_connected_ago,
            last_message_sent_ago_seconds: last_message_sent_ago,
            last_message_received_ago_seconds: last_message_received_ago,
            connection_attempts: mqtt_health.connection_attempts,
        },
        uptime_seconds: app_status.uptime_seconds(),
        timestamp: system_time,
    };

    (overall_healthy, response)
}

/// Configured devices first, in config order, then whatever else reported a state
fn device_overview(app_status: &AppStatus, configured: &[String]) -> Vec<DeviceInfo> {
    let mut names: Vec<String> = configured.to_vec();
    let mut extra: Vec<String> = app_status.devices.keys().filter(|k| !configured.contains(k)).cloned().collect();
    extra.sort();
    names.extend(extra);

    names
        .into_iter()
        .map(|name| match app_status.devices.get(&name) {
            Some(health) => DeviceInfo {
                protocol: health.protocol.map(|p| p.to_string()),
                status: health.status.to_string(),
                reason: health.status.reason().map(|r| r.to_string()),
                invalid_frames: health.invalid_frames,
                three_phase: health.capabilities.map(|c| c.three_phase),
                producer: health.capabilities.map(|c| c.producer),
                last_update: health.last_update,
                name,
            },
            None => DeviceInfo {
                name,
                protocol: None,
                status: "unknown".to_string(),
                reason: None,
                invalid_frames: 0,
                three_phase: None,
                producer: None,
                last_update: None,
            },
        })
        .collect()
}

#[utoipa::path(get,
    path = "/health",
    summary = "Health check endpoint for container monitoring",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse),
        (status = 503, description = "Service is unhealthy")
    ),
)]
async fn health_check() -> impl Responder {
    let app_status = get_app_status().await;
    let (healthy, response) = health_response(&app_status);

    if healthy {
        HttpResponse::Ok().json(response)
    } else {
        HttpResponse::ServiceUnavailable().json(response)
    }
}

#[utoipa::path(get,
    path = "/api/v1/config",
    summary = "Get the whole configuration as loaded by the application",
    responses(
        (status = 200, description = "Get current running config")
    ),
)]
async fn get_config() -> impl Responder {
    let config = match CONFIG.read() {
        Ok(c) => c.get_complete_config(),
        Err(_) => return HttpResponse::InternalServerError().finish(),
    };
    HttpResponse::Ok().content_type("application/json").json(config)
}

#[utoipa::path(get,
    path = "/api/v1/devices",
    summary = "Get the last known status and invalid frame count of every meter",
    responses(
        (status = 200, description = "Device overview", body = [DeviceInfo])
    ),
)]
async fn get_devices() -> impl Responder {
    let configured = match CONFIG.read() {
        Ok(c) => c.get_complete_config().device_names(),
        Err(_) => return HttpResponse::InternalServerError().finish(),
    };
    let app_status = get_app_status().await;
    HttpResponse::Ok().json(device_overview(&app_status, &configured))
}

impl ApiManager {
    pub fn new() -> Self {
        return ApiManager;
    }

    pub async fn start_thread(&self) {

        let config = get_config_or_panic!("httpd", ConfigBases::Httpd);

        if !config.enabled {
            info!("Webserver disabled by config");
            return;
        }

        #[derive(OpenApi)]
        #[openapi(
            info(description = "linky2MQTT API description"),
            paths(
                    health_check,
                    get_config,
                    get_devices,
            ),
            components(schemas(DeviceInfo, HealthResponse, MqttHealthInfo))
        )]
        struct ApiDoc;

        let server = HttpServer::new(move || {
            App::new()
                .route("/health", web::get().to(health_check))
                .route("/api/v1/config", web::get().to(get_config))
                .route("/api/v1/devices", web::get().to(get_devices))
                .service(
                    SwaggerUi::new("/swagger-ui/{_:.*}")
                        .url("/api/v1/openapi.json", ApiDoc::openapi()),
                )
        })
        .bind(format!("0.0.0.0:{}", config.port));

        match server {
            Ok(server) => {
                info!("API listening on port {}", config.port);
                if let Err(e) = server.run().await {
                    error!("API server stopped: {e}");
                }
            }
            Err(e) => error!("Unable to bind API on port {}: {e}", config.port),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linky::device::MeterCapabilities;
    use crate::models::{DeviceProtocol, DeviceStatus};
    use crate::mqtt::Transmission;
    use actix_web::{body::to_bytes, test as actix_test};

    #[test]
    fn test_unhealthy_without_broker() {
        let (healthy, response) = health_response(&AppStatus::new());
        assert!(!healthy);
        assert_eq!(response.status, "unhealthy");
        assert_eq!(response.mqtt.status, "disconnected");
    }

    #[test]
    fn test_device_overview() {
        let mut status = AppStatus::new();
        status.track(&Transmission::Status {
            device: "d2l".to_string(),
            protocol: DeviceProtocol::D2l,
            status: DeviceStatus::Offline("Address in use".to_string()),
        });
        status.track(&Transmission::Capabilities {
            device: "linky".to_string(),
            capabilities: MeterCapabilities { three_phase: false, producer: true },
        });
        status.track(&Transmission::InvalidFrames { device: "stray".to_string(), count: 4 });

        let overview = device_overview(&status, &["linky".to_string(), "d2l".to_string(), "idle".to_string()]);
        let names: Vec<&str> = overview.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["linky", "d2l", "idle", "stray"]);
        assert_eq!(overview[0].producer, Some(true));
        assert_eq!(overview[1].status, "offline");
        assert_eq!(overview[1].reason.as_deref(), Some("Address in use"));
        assert_eq!(overview[1].protocol.as_deref(), Some("D2L"));
        assert_eq!(overview[2].status, "unknown");
        assert_eq!(overview[3].invalid_frames, 4);
    }

    #[actix_rt::test]
    async fn test_health_endpoint() {
        let app = actix_test::init_service(App::new().route("/health", web::get().to(health_check))).await;
        let req = actix_test::TestRequest::get().uri("/health").to_request();
        let resp = actix_test::call_service(&app, req).await;
        /* Nothing connects to a broker in tests */
        assert_eq!(resp.status(), actix_web::http::StatusCode::SERVICE_UNAVAILABLE);

        let body = to_bytes(resp.into_body()).await.unwrap();
        let doc: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(doc["mqtt"]["status"], "disconnected");
    }
}
