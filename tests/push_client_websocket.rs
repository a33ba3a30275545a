//! Exercises `AmberPushClient` against a local `tokio-tungstenite` server
//! standing in for the live-prices WebSocket feed (§3's push producer).

use futures_util::{SinkExt, StreamExt};
use open_energy_controller::config::AmberConfig;
use open_energy_controller::domain::ForecastType;
use open_energy_controller::price_source::push::AmberPushClient;
use open_energy_controller::price_source::PriceSource;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

async fn start_mock_feed() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

        // Expect and drop the subscribe message, ack it, then push one update.
        let _subscribe = ws.next().await;
        ws.send(Message::Text(r#"{"action":"subscribe","status":200}"#.to_string())).await.unwrap();

        let update = serde_json::json!({
            "action": "price-update",
            "data": {
                "siteId": "01HSITE",
                "prices": [{
                    "type": "CurrentInterval",
                    "channelType": "general",
                    "nemTime": "2024-06-10T15:05:00+10:00",
                    "duration": 5,
                    "perKwh": 31.2,
                    "advancedPrice": null
                }]
            }
        });
        ws.send(Message::Text(update.to_string())).await.unwrap();

        // Keep the socket open so the client's read loop doesn't error out
        // before the test gets a chance to observe the cached update.
        tokio::time::sleep(std::time::Duration::from_secs(2)).await;
    });

    format!("ws://{addr}")
}

#[tokio::test]
async fn push_client_caches_price_update_and_notifies_sync() {
    let ws_url = start_mock_feed().await;
    let cfg = AmberConfig {
        site_id: "01HSITE".to_string(),
        rest_base_url: "https://example.invalid".to_string(),
        ws_url,
        api_key: "test-key".to_string(),
        rest_poll_interval_secs: 60,
        ws_ping_interval_secs: 30,
        ws_ping_timeout_secs: 10,
        max_staleness_secs: 600,
        sync_cooldown_secs: 0,
    };

    let (tx, mut rx) = mpsc::channel(1);
    let client = std::sync::Arc::new(AmberPushClient::new(&cfg, cfg.site_id.clone(), ForecastType::Predicted, tx));

    let run_handle = tokio::spawn(client.clone().run_forever());

    let notified = tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv()).await;
    assert!(notified.is_ok(), "expected a sync notification after the price update");

    let current = client.current_prices(chrono::Duration::seconds(30)).await.unwrap();
    assert_eq!(current.len(), 1);
    assert_eq!(current[0].per_kwh, 31.2);

    run_handle.abort();
}
