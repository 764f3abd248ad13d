// src/utils/connectivity.rs
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    async fn is_online(&self) -> bool;
}

/// Online when `url` answers at all within `timeout`.
pub struct HttpProbe {
    client: Client,
    url: String,
    timeout: Duration,
}

impl HttpProbe {
    pub fn new(url: String, timeout: Duration) -> Self {
        Self {
            client: Client::new(),
            url,
            timeout,
        }
    }
}

#[async_trait]
impl ConnectivityProbe for HttpProbe {
    async fn is_online(&self) -> bool {
        match self.client.get(&self.url).timeout(self.timeout).send().await {
            Ok(_) => true,
            Err(e) => {
                debug!("Connectivity probe failed: {}", e);
                false
            }
        }
    }
}

pub struct AlwaysOnline;

#[async_trait]
impl ConnectivityProbe for AlwaysOnline {
    async fn is_online(&self) -> bool {
        true
    }
}

/// Polls `probe` every `interval`. Returns false if shutdown came first.
pub async fn wait_for_connectivity(
    probe: &dyn ConnectivityProbe,
    interval: Duration,
    shutdown: &mut watch::Receiver<bool>,
) -> bool {
    let mut announced = false;
    loop {
        if *shutdown.borrow() {
            return false;
        }
        if probe.is_online().await {
            if announced {
                info!("Connectivity restored");
            }
            return true;
        }
        if !announced {
            info!("Waiting for connectivity...");
            announced = true;
        }
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() {
                    return false;
                }
            }
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct OnlineAfter(AtomicUsize);

    #[async_trait]
    impl ConnectivityProbe for OnlineAfter {
        async fn is_online(&self) -> bool {
            self.0.fetch_sub(1, Ordering::SeqCst) <= 1
        }
    }

    #[tokio::test]
    async fn waits_until_probe_succeeds() {
        let (_tx, mut rx) = watch::channel(false);
        let probe = OnlineAfter(AtomicUsize::new(3));
        assert!(wait_for_connectivity(&probe, Duration::from_millis(1), &mut rx).await);
        assert_eq!(probe.0.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn shutdown_interrupts_the_wait() {
        let (tx, mut rx) = watch::channel(false);
        let probe = OnlineAfter(AtomicUsize::new(usize::MAX));
        tx.send(true).unwrap();
        assert!(!wait_for_connectivity(&probe, Duration::from_secs(60), &mut rx).await);
    }
}
