use std::sync::Arc;

/// What a listener does when it is polled but cannot prove that the waker it was given belongs
/// to a driver running on this thread.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FastPathPolicy {
    /// Clone the waker and wake it when the promise settles.
    Fallback,
    /// Treat a missing fast path as a programming error and panic.
    Strict,
}

impl Default for FastPathPolicy {
    fn default() -> Self {
        Self::Fallback
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub name: Arc<str>,
    pub fast_path: FastPathPolicy,
    pub detect_deadlock: bool,
}

impl Default for Config {
    fn default() -> Self {
        ConfigBuilder::default().build()
    }
}

#[derive(Default)]
pub struct ConfigBuilder {
    pub name: Option<Arc<str>>,
    pub fast_path: Option<FastPathPolicy>,
    pub detect_deadlock: Option<bool>,
}

impl ConfigBuilder {
    pub fn name(&mut self, name: impl Into<Arc<str>>) -> &mut Self {
        self.name = Some(name.into());
        self
    }

    pub fn fast_path(&mut self, policy: FastPathPolicy) -> &mut Self {
        self.fast_path = Some(policy);
        self
    }

    pub fn detect_deadlock(&mut self, enabled: bool) -> &mut Self {
        self.detect_deadlock = Some(enabled);
        self
    }

    pub fn build(&self) -> Config {
        Config {
            name: self
                .name
                .as_ref()
                .map(|name| name.clone())
                .unwrap_or_else(|| Arc::from("promise-bridge")),
            fast_path: self.fast_path.unwrap_or_default(),
            detect_deadlock: self.detect_deadlock.unwrap_or(true),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(&*config.name, "promise-bridge");
        assert_eq!(config.fast_path, FastPathPolicy::Fallback);
        assert!(config.detect_deadlock);
    }

    #[test]
    fn overrides() {
        let config = ConfigBuilder::default()
            .name("worker-loop")
            .fast_path(FastPathPolicy::Strict)
            .detect_deadlock(false)
            .build();

        assert_eq!(&*config.name, "worker-loop");
        assert_eq!(config.fast_path, FastPathPolicy::Strict);
        assert!(!config.detect_deadlock);
    }
}
