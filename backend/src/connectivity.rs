use tokio::sync::watch;

/// Creates the liveness cell for the broker connection.
///
/// The [`LinkReporter`] goes to the transport event loop, the only place
/// allowed to change liveness. [`Connectivity`] handles are read-only and may
/// be cloned freely.
pub fn monitor() -> (LinkReporter, Connectivity) {
    let (tx, rx) = watch::channel(false);
    (LinkReporter { tx }, Connectivity { rx })
}

#[derive(Debug)]
pub struct LinkReporter {
    tx: watch::Sender<bool>,
}

impl LinkReporter {
    pub fn connected(&self) {
        self.tx.send_replace(true);
    }

    pub fn disconnected(&self) {
        self.tx.send_replace(false);
    }

    pub fn error(&self) {
        self.tx.send_replace(false);
    }
}

#[derive(Debug, Clone)]
pub struct Connectivity {
    rx: watch::Receiver<bool>,
}

impl Connectivity {
    pub fn is_live(&self) -> bool {
        *self.rx.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readers_follow_lifecycle_callbacks() {
        let (reporter, connectivity) = monitor();
        let other = connectivity.clone();
        assert!(!connectivity.is_live());

        reporter.connected();
        assert!(connectivity.is_live());
        assert!(other.is_live());

        reporter.error();
        assert!(!other.is_live());

        reporter.connected();
        reporter.disconnected();
        assert!(!connectivity.is_live());
    }

    #[test]
    fn readers_survive_reporter_drop() {
        let (reporter, connectivity) = monitor();
        reporter.connected();
        drop(reporter);
        assert!(connectivity.is_live());
    }
}
