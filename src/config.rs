use std::time::Duration;

/// Adapter-wide settings shared by every connection session.
#[derive(Debug, Clone)]
pub struct Config {
    /// Scans without their own timeout stop after this duration.
    pub(crate) scan_timeout: Option<Duration>,
    /// Upper bound for connecting and discovering services.
    pub(crate) connect_timeout: Duration,
    /// Upper bound for a single GATT operation once it has been dispatched.
    pub(crate) operation_timeout: Duration,
    /// Reconnect automatically when the link is lost without being asked to.
    pub(crate) auto_reconnect: bool,
    /// Number of reconnect attempts before giving up.
    pub(crate) max_retries: u32,
    /// Delay before the first reconnect attempt, doubled for every retry.
    pub(crate) backoff_base: Duration,
    /// Whether `Characteristic::subscribe` asks for indications.
    pub(crate) use_indication_default: bool,
    /// Buffered values per characteristic before a slow subscriber lags.
    pub(crate) notification_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            scan_timeout: None,
            connect_timeout: Duration::from_secs(30),
            operation_timeout: Duration::from_secs(15),
            auto_reconnect: false,
            max_retries: 3,
            backoff_base: Duration::from_millis(500),
            use_indication_default: false,
            notification_capacity: 64,
        }
    }
}

impl Config {
    /// Stop scans after given duration unless the scan sets its own timeout
    pub fn scan_timeout(mut self, timeout: Duration) -> Self {
        self.scan_timeout = Some(timeout);
        self
    }

    /// Fail connection attempts that take longer than given duration
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Fail GATT operations that take longer than given duration
    pub fn operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    /// Reconnect after an unexpected link loss
    pub fn auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    pub fn use_indication_default(mut self, indicate: bool) -> Self {
        self.use_indication_default = indicate;
        self
    }

    pub fn notification_capacity(mut self, capacity: usize) -> Self {
        self.notification_capacity = capacity.max(1);
        self
    }

    /// Delay before reconnect attempt `attempt`, counting from zero.
    pub(crate) fn backoff(&self, attempt: u32) -> Duration {
        1u32.checked_shl(attempt)
            .and_then(|factor| self.backoff_base.checked_mul(factor))
            .unwrap_or(Duration::MAX)
    }
}
