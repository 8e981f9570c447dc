use tokio::sync::watch;

/// One-shot stop signal for a plugin generation.
///
/// Triggering flips the shared flag once; every [`ShutdownListener`] observes
/// it, including listeners created afterwards. Dropping the coordinator counts
/// as a trigger for listeners still waiting.
#[derive(Debug)]
pub struct ShutdownCoordinator {
    tx: watch::Sender<bool>,
}

#[derive(Debug, Clone)]
pub struct ShutdownListener {
    rx: watch::Receiver<bool>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    pub fn listener(&self) -> ShutdownListener {
        ShutdownListener {
            rx: self.tx.subscribe(),
        }
    }

    /// Returns false if the signal had already fired.
    pub fn trigger(&self) -> bool {
        self.tx.send_if_modified(|stopped| {
            if *stopped {
                false
            } else {
                *stopped = true;
                true
            }
        })
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownListener {
    pub async fn wait(&mut self) {
        // Err means the coordinator is gone, which is also a stop.
        let _ = self.rx.wait_for(|stopped| *stopped).await;
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_all_listeners_observe_trigger() {
        let coordinator = ShutdownCoordinator::new();
        let mut first = coordinator.listener();
        let mut second = coordinator.listener();

        assert!(coordinator.trigger());
        assert!(!coordinator.trigger());

        tokio::time::timeout(Duration::from_secs(1), first.wait())
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(1), second.wait())
            .await
            .unwrap();

        let mut late = coordinator.listener();
        assert!(late.is_triggered());
        tokio::time::timeout(Duration::from_secs(1), late.wait())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_drop_releases_listeners() {
        let coordinator = ShutdownCoordinator::new();
        let mut listener = coordinator.listener();
        drop(coordinator);

        tokio::time::timeout(Duration::from_secs(1), listener.wait())
            .await
            .unwrap();
    }
}
