//! Log tee: every record goes to the normal logger, and warnings and above
//! are additionally queued for the gateway log channel with a timestamp
//! prefix, so a remote operator sees what the journal sees.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use chrono::Local;
use log::{Log, Metadata, Record};

/// Upper bound on queued gateway log lines while no client is attached.
const GW_LOG_CAP: usize = 100;

/// Shared queue of formatted log lines awaiting gateway output.
pub type GatewayLogBuffer = Arc<Mutex<VecDeque<String>>>;

/// Create an empty gateway log buffer.
pub fn new_buffer() -> GatewayLogBuffer {
    Arc::new(Mutex::new(VecDeque::new()))
}

struct TeeLogger {
    inner: env_logger::Logger,
    buffer: GatewayLogBuffer,
}

impl Log for TeeLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        self.inner.enabled(metadata)
    }

    fn log(&self, record: &Record<'_>) {
        self.inner.log(record);

        if record.level() <= log::Level::Warn {
            let line = format!(
                "{}: {}\r\n",
                Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.args()
            );
            let mut buffer = self.buffer.lock().unwrap();
            if buffer.len() >= GW_LOG_CAP {
                buffer.pop_front();
            }
            buffer.push_back(line);
        }
    }

    fn flush(&self) {
        self.inner.flush();
    }
}

/// Install the tee logger. Returns the buffer the gateway parser drains.
pub fn init() -> GatewayLogBuffer {
    let buffer = new_buffer();
    let inner = env_logger::Builder::from_default_env().build();
    let max_level = inner.filter();
    let logger = TeeLogger {
        inner,
        buffer: Arc::clone(&buffer),
    };
    if log::set_boxed_logger(Box::new(logger)).is_ok() {
        log::set_max_level(max_level);
    }
    buffer
}
