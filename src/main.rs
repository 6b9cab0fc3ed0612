use linky2mqtt::{mqtt::publish_uptime, LinkyManager, MqttManager};
#[cfg(feature = "api")]
use linky2mqtt::ApiManager;
use tokio::task::JoinHandle;
use std::time::Duration;
use log::{error, info};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);


#[cfg_attr(feature = "api", actix_web::main)]
#[cfg_attr(not(feature = "api"), tokio::main)]
async fn main() -> std::io::Result<()> {
    // Initialize logging
    let default_filter =  std::env::var("L2M_LOG_LEVEL").unwrap_or("info".to_string());
    env_logger::init_from_env(env_logger::Env::new().default_filter_or(default_filter));

    // we need a channel for the subparts to send channel updates to the handler
    let (mut mqtt, tx) = MqttManager::new()?;

    let mut threads: Vec<JoinHandle<()>> = Vec::new();

    threads.push(tokio::spawn(async move {
        mqtt.start_thread().await;
    }));

    // Start the serial links and D2L listeners
    let mut linky = LinkyManager::new(tx.clone());
    let linky_stop = linky.stop_handle();
    threads.push(tokio::spawn(async move {
        linky.start_thread().await;
    }));

    /* Run our api gateway now */
    #[cfg(feature = "api")]
    {
        let api = ApiManager::new();
        threads.push(actix_web::rt::spawn(async move {
            api.start_thread().await;
            /* A disabled or failed API must not take the acquisition down */
            std::future::pending::<()>().await;
        }));
    }

    /* Periodic uptime publishing */
    let uptime_sender = tx.clone();
    threads.push(tokio::spawn(async move {
        publish_uptime(&uptime_sender).await;

        let mut interval = tokio::time::interval(Duration::from_secs(10));
        interval.tick().await; // Skip first immediate tick since we already published

        loop {
            interval.tick().await;
            publish_uptime(&uptime_sender).await;
        }
    }));

    info!("All modules started, now waiting for a signal to exit");
    let mut check = tokio::time::interval(Duration::from_secs(10));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Signal received, shutting down");
                break;
            },
            _ = check.tick() => {
                if threads.iter().any(|task| task.is_finished()) {
                    error!("A module stopped, shutting down");
                    break;
                }
            },
        }
    }

    /* Give the loops one read timeout to close their ports and publish their offline state */
    linky_stop.stop();
    tokio::time::sleep(SHUTDOWN_GRACE).await;

    for task in threads.iter_mut() {
        task.abort();
    }
    Ok(())
}
