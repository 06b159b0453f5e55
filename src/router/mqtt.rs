//! MQTT detection sink (rumqttc, synchronous client).
//!
//! The connection event loop runs on its own thread and reconnects by
//! itself; `deliver` only enqueues an at-least-once publish. Both halves
//! stop when the sink (and with it the client) is dropped.

use super::{DetectionEvent, Sink};
use crate::config::MqttConfig;
use anyhow::{Context, Result};
use rumqttc::{Client, MqttOptions, QoS, Transport};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info};

pub struct MqttSink {
    client: Client,
    topic_template: String,
    _event_loop: JoinHandle<()>,
}

impl MqttSink {
    pub fn connect(cfg: &MqttConfig) -> Result<MqttSink> {
        let client_id = format!("skylark-{}", std::process::id());
        let mut options = MqttOptions::new(client_id, cfg.host.clone(), cfg.port);
        options.set_keep_alive(Duration::from_secs(30));
        if let (Some(user), Some(pass)) = (&cfg.username, &cfg.password) {
            options.set_credentials(user.clone(), pass.clone());
        }
        if cfg.tls {
            options.set_transport(Transport::Tls(rumqttc::TlsConfiguration::Native));
        }

        let (client, mut connection) = Client::new(options, 16);
        let host = cfg.host.clone();
        let event_loop = std::thread::Builder::new()
            .name("mqtt-conn".to_string())
            .spawn(move || {
                // The iterator reconnects internally; errors are throttled so
                // a dead broker does not spin the thread.
                for event in connection.iter() {
                    match event {
                        Ok(event) => debug!(?event, "mqtt event"),
                        Err(e) => {
                            debug!(host = %host, error = %e, "mqtt connection error");
                            std::thread::sleep(Duration::from_secs(1));
                        }
                    }
                }
            })
            .context("spawning mqtt connection thread")?;

        info!(host = %cfg.host, port = cfg.port, "mqtt sink connected");
        Ok(MqttSink {
            client,
            topic_template: cfg.topic.clone(),
            _event_loop: event_loop,
        })
    }

    fn topic_for(&self, event: &DetectionEvent) -> String {
        self.topic_template
            .replace("{source}", &event.detection.source)
            .replace("{code}", &event.detection.species_code)
    }
}

impl Sink for MqttSink {
    fn kind(&self) -> &'static str {
        "mqtt"
    }

    fn deliver(&mut self, event: &DetectionEvent) -> Result<()> {
        let topic = self.topic_for(event);
        let payload = serde_json::to_vec(event).context("encoding mqtt payload")?;
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .context("publishing to mqtt")?;
        Ok(())
    }
}
