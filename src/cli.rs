use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "sensor-ingest",
    version,
    about = "Industrial telemetry ingest and retrieval service"
)]
pub struct Args {
    #[arg(long, default_value = "0.0.0.0")]
    pub host: String,
    #[arg(long, default_value_t = 8080)]
    pub port: u16,
    /// Serve HTTP only, even when ENABLE_MQTT is set.
    #[arg(long, default_value_t = false)]
    pub no_mqtt: bool,
}
