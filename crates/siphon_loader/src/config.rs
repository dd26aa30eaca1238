//! Downstream connection configuration and executor knob defaults.

use mysql_async::{Opts, OptsBuilder};
use serde::{Deserialize, Serialize};

/// Default number of DMLs per sub-batch transaction.
pub const DEFAULT_BATCH_SIZE: usize = 128;
/// Default number of concurrently running sub-batch tasks.
pub const DEFAULT_WORKER_COUNT: usize = 16;

/// How updates are generated when the upstream schema may be ahead of the
/// downstream one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncMode {
    /// Row images carry every column.
    #[default]
    FullColumn,
    /// Row images may omit columns; the downstream fills defaults.
    PartialColumn,
}

/// Downstream database connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    /// Default database for the connection; statements still qualify tables
    /// explicitly unless the loopback filter cleared the schema.
    #[serde(default)]
    pub db_name: Option<String>,
    #[serde(default)]
    pub sync_mode: SyncMode,
}

impl DbConfig {
    /// Driver options for this configuration.
    pub fn to_opts(&self) -> Opts {
        OptsBuilder::default()
            .ip_or_hostname(self.host.clone())
            .tcp_port(self.port)
            .user(Some(self.user.clone()))
            .pass(Some(self.password.clone()))
            .db_name(self.db_name.clone())
            .into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_round_trips_through_serde() {
        let cfg = DbConfig {
            host: "10.0.0.5".into(),
            port: 4000,
            user: "repl".into(),
            password: "secret".into(),
            db_name: Some("app".into()),
            sync_mode: SyncMode::PartialColumn,
        };
        let json = serde_json::to_string(&cfg).unwrap();
        let back: DbConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.host, cfg.host);
        assert_eq!(back.port, cfg.port);
        assert_eq!(back.sync_mode, SyncMode::PartialColumn);
    }

    #[test]
    fn omitted_fields_take_defaults() {
        let json = r#"{"host":"h","port":3306,"user":"u","password":"p"}"#;
        let cfg: DbConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.db_name, None);
        assert_eq!(cfg.sync_mode, SyncMode::FullColumn);
    }

    #[test]
    fn opts_carry_the_endpoint() {
        let cfg = DbConfig {
            host: "db.example".into(),
            port: 3307,
            user: "u".into(),
            password: "p".into(),
            db_name: None,
            sync_mode: SyncMode::FullColumn,
        };
        let opts = cfg.to_opts();
        assert_eq!(opts.ip_or_hostname(), "db.example");
        assert_eq!(opts.tcp_port(), 3307);
    }
}
