use crate::gaddr::WorkerId;

/// Log verbosity for the CLI harnesses. The library itself just emits
/// `tracing` events; this only controls what the harness binaries subscribe
/// to.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Per-process configuration, equivalent to the original `struct Conf`.
#[derive(Clone, Debug)]
pub struct Config {
    pub no_node: i64,
    pub is_master: bool,
    pub no_node_id: WorkerId,
    pub master_ip: String,
    pub master_port: u16,
    pub worker_ip: String,
    pub worker_port: u16,
    /// Per-worker heap size in bytes.
    pub size: u64,
    /// Ghost-byte threshold: a worker pushes `UPDATE_MEM_STATS` once it has
    /// allocated this many bytes since its last push.
    pub ghost_th: u64,
    /// Coordinator queue size that triggers a `BROADCAST_MEM_STATS`.
    pub unsynced_th: usize,
    /// Slab class growth factor.
    pub factor: f64,
    /// Service-task poll budget, in milliseconds.
    pub timeout_ms: u64,
    pub log_level: LogLevel,
    pub log_file: Option<String>,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            no_node: 1,
            is_master: true,
            no_node_id: 1,
            master_ip: "localhost".to_string(),
            master_port: 12345,
            worker_ip: "localhost".to_string(),
            worker_port: 12346,
            size: 512 * 1024 * 1024,
            ghost_th: 1024 * 1024,
            unsynced_th: 1,
            factor: 1.25,
            timeout_ms: 10,
            log_level: LogLevel::Info,
            log_file: None,
        }
    }
}

/// Builder for [`Config`], so CLI harnesses can override a handful of fields
/// without repeating every default.
#[derive(Clone, Debug, Default)]
pub struct ConfigBuilder(Config);

impl ConfigBuilder {
    pub fn new() -> ConfigBuilder {
        ConfigBuilder(Config::default())
    }

    pub fn no_node(mut self, n: i64) -> Self {
        self.0.no_node = n;
        self
    }

    pub fn is_master(mut self, v: bool) -> Self {
        self.0.is_master = v;
        self
    }

    pub fn no_node_id(mut self, id: WorkerId) -> Self {
        self.0.no_node_id = id;
        self
    }

    pub fn master_addr(mut self, ip: impl Into<String>, port: u16) -> Self {
        self.0.master_ip = ip.into();
        self.0.master_port = port;
        self
    }

    pub fn worker_addr(mut self, ip: impl Into<String>, port: u16) -> Self {
        self.0.worker_ip = ip.into();
        self.0.worker_port = port;
        self
    }

    pub fn size(mut self, bytes: u64) -> Self {
        self.0.size = bytes;
        self
    }

    pub fn ghost_th(mut self, bytes: u64) -> Self {
        self.0.ghost_th = bytes;
        self
    }

    pub fn unsynced_th(mut self, n: usize) -> Self {
        self.0.unsynced_th = n;
        self
    }

    pub fn factor(mut self, f: f64) -> Self {
        self.0.factor = f;
        self
    }

    pub fn timeout_ms(mut self, ms: u64) -> Self {
        self.0.timeout_ms = ms;
        self
    }

    pub fn log_level(mut self, lvl: LogLevel) -> Self {
        self.0.log_level = lvl;
        self
    }

    pub fn log_file(mut self, f: impl Into<String>) -> Self {
        self.0.log_file = Some(f.into());
        self
    }

    pub fn build(self) -> Config {
        self.0
    }
}

impl Config {
    /// Reads `FARM_*` environment variables over the defaults. Unset
    /// variables are left at their default value; malformed ones are
    /// ignored (the default wins) rather than causing a boot-time panic,
    /// since this is test-harness convenience, not library surface.
    pub fn from_env() -> Config {
        let mut c = Config::default();
        if let Ok(v) = std::env::var("FARM_NO_NODE") {
            if let Ok(n) = v.parse() {
                c.no_node = n;
            }
        }
        if let Ok(v) = std::env::var("FARM_IS_MASTER") {
            c.is_master = v == "1" || v.eq_ignore_ascii_case("true");
        }
        if let Ok(v) = std::env::var("FARM_NODE_ID") {
            if let Ok(n) = v.parse() {
                c.no_node_id = n;
            }
        }
        if let Ok(v) = std::env::var("FARM_MASTER_IP") {
            c.master_ip = v;
        }
        if let Ok(v) = std::env::var("FARM_MASTER_PORT") {
            if let Ok(n) = v.parse() {
                c.master_port = n;
            }
        }
        if let Ok(v) = std::env::var("FARM_WORKER_IP") {
            c.worker_ip = v;
        }
        if let Ok(v) = std::env::var("FARM_WORKER_PORT") {
            if let Ok(n) = v.parse() {
                c.worker_port = n;
            }
        }
        if let Ok(v) = std::env::var("FARM_SIZE") {
            if let Ok(n) = v.parse() {
                c.size = n;
            }
        }
        if let Ok(v) = std::env::var("FARM_GHOST_TH") {
            if let Ok(n) = v.parse() {
                c.ghost_th = n;
            }
        }
        if let Ok(v) = std::env::var("FARM_UNSYNCED_TH") {
            if let Ok(n) = v.parse() {
                c.unsynced_th = n;
            }
        }
        if let Ok(v) = std::env::var("FARM_FACTOR") {
            if let Ok(n) = v.parse() {
                c.factor = n;
            }
        }
        if let Ok(v) = std::env::var("FARM_TIMEOUT_MS") {
            if let Ok(n) = v.parse() {
                c.timeout_ms = n;
            }
        }
        c
    }
}
