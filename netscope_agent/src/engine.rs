//! Wiring: build the store and session, spawn every sampler plus the
//! persistence task, and tear them down in order.
//!
//! Shutdown order matters. Samplers are cancelled and joined first (bounded
//! by a grace period, stragglers aborted). Only then is persistence
//! cancelled, so its single final flush sees every mutation that will ever
//! happen.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::bench::{HttpSpeedTest, HttpUploadTarget, SpeedTest, UploadTarget, DEFAULT_UPLOAD_URL};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::geo::{GeoResolver, HttpGeoResolver};
use crate::latency::{Prober, TcpConnectProber};
use crate::link::{resolve_addressing, LinkResolver, SystemLinkResolver};
use crate::metrics::{CounterSource, ProcessEnumerator, SysinfoHost, SystemGauges};
use crate::persist::{spawn_persistence, PersistenceConfig, PersistenceReport, SessionWriter};
use crate::plot::{PlotRenderer, SvgPlotRenderer};
use crate::sampler;
use crate::state::{Mutation, SharedStore, SnapshotStore};
use crate::types::HostAddressing;

const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// External collaborators. `None` disables the task that uses it.
#[derive(Clone)]
pub struct Collaborators {
    pub link: Arc<dyn LinkResolver>,
    pub prober: Arc<dyn Prober>,
    pub plot: Arc<dyn PlotRenderer>,
    pub geo: Option<Arc<dyn GeoResolver>>,
    pub upload: Option<Arc<dyn UploadTarget>>,
    pub speedtest: Option<Arc<dyn SpeedTest>>,
}

impl Collaborators {
    /// Platform tools and public HTTP endpoints.
    pub fn system(config: &EngineConfig) -> Result<Self, EngineError> {
        let mut c = Self {
            link: Arc::new(SystemLinkResolver::default()),
            prober: Arc::new(TcpConnectProber::new(config.probe_target.clone(), PROBE_TIMEOUT)),
            plot: Arc::new(SvgPlotRenderer::default()),
            geo: None,
            upload: None,
            speedtest: None,
        };
        if !config.offline {
            c.geo = Some(Arc::new(HttpGeoResolver::new(config.http_timeout)?));
            c.speedtest = Some(Arc::new(HttpSpeedTest::new(config.speedtest_timeout)?));
            if !config.upload_test.is_zero() {
                c.upload = Some(Arc::new(HttpUploadTarget::new(DEFAULT_UPLOAD_URL, config.http_timeout)?));
            }
        }
        Ok(c)
    }
}

/// A running engine. Dropping it without [`Engine::shutdown`] leaves the
/// tasks running until the runtime stops.
pub struct Engine {
    store: SharedStore,
    session_dir: PathBuf,
    samplers_cancel: CancellationToken,
    persist_cancel: CancellationToken,
    samplers: Vec<(&'static str, JoinHandle<()>)>,
    persistence: JoinHandle<PersistenceReport>,
}

impl Engine {
    /// Start against the local host: sysinfo counters, platform link tools,
    /// and the public HTTP collaborators unless `config.offline`.
    pub async fn start_system(config: EngineConfig) -> Result<Self, EngineError> {
        let host = SysinfoHost::new(config.interface.clone())?;
        let (iface, address, subnet) = host.local_address();
        let addressing = resolve_addressing(iface, address, subnet);
        let collaborators = Collaborators::system(&config)?;
        Self::start(config, host, addressing, collaborators).await
    }

    /// Everything that can fail fatally happens before the first task is
    /// spawned.
    pub async fn start<H>(
        config: EngineConfig,
        host: H,
        addressing: HostAddressing,
        collab: Collaborators,
    ) -> Result<Self, EngineError>
    where
        H: CounterSource + ProcessEnumerator + SystemGauges + 'static,
    {
        let config = config.normalized();
        let store = SnapshotStore::shared(config.history_capacity);
        info!(
            interface = %addressing.interface,
            address = %addressing.local_address,
            gateway = %addressing.gateway,
            "host addressing"
        );
        store.apply(Mutation::Addressing(addressing));

        // The session is keyed by the link name, so resolve it once up front.
        let link = collab.link.resolve().await;
        let identity = link.name.clone();
        store.apply(Mutation::Link(link));
        let writer = SessionWriter::create(&config.history_dir, &identity, Local::now(), &store.read())?;
        let session_dir = writer.dir().to_path_buf();

        let samplers_cancel = CancellationToken::new();
        let persist_cancel = CancellationToken::new();
        let c = &config.cadences;
        let mut samplers = vec![
            (
                "rate",
                sampler::spawn_rate_sampler(store.clone(), host, c.rate, samplers_cancel.clone()),
            ),
            (
                "latency",
                sampler::spawn_latency_sampler(
                    store.clone(),
                    collab.prober.clone(),
                    c.latency_pause,
                    samplers_cancel.clone(),
                ),
            ),
            (
                "link",
                sampler::spawn_link_sampler(store.clone(), collab.link.clone(), c.link, samplers_cancel.clone()),
            ),
        ];
        if let Some(geo) = collab.geo.clone() {
            samplers.push((
                "geo",
                sampler::spawn_geo_sampler(store.clone(), geo, c.geo, samplers_cancel.clone()),
            ));
        }
        if let Some(target) = collab.upload.clone() {
            if !config.upload_test.is_zero() {
                samplers.push((
                    "upload-test",
                    sampler::spawn_upload_test(store.clone(), target, config.upload_test, samplers_cancel.clone()),
                ));
            }
        }
        if let Some(client) = collab.speedtest.clone() {
            samplers.push((
                "speedtest",
                sampler::spawn_speedtest_sampler(
                    store.clone(),
                    client,
                    config.speedtest_mode,
                    c.speedtest,
                    config.speedtest_timeout,
                    samplers_cancel.clone(),
                ),
            ));
        }

        let persistence = spawn_persistence(
            store.clone(),
            writer,
            collab.plot.clone(),
            PersistenceConfig {
                save_interval: config.save_interval,
                ..PersistenceConfig::default()
            },
            persist_cancel.clone(),
        );

        info!(tasks = samplers.len(), session = %session_dir.display(), "engine started");
        Ok(Self {
            store,
            session_dir,
            samplers_cancel,
            persist_cancel,
            samplers,
            persistence,
        })
    }

    pub fn store(&self) -> SharedStore {
        self.store.clone()
    }

    pub fn session_dir(&self) -> &Path {
        &self.session_dir
    }

    /// Stop every sampler, then let persistence write its final flush.
    pub async fn shutdown(self, grace: Duration) -> PersistenceReport {
        self.samplers_cancel.cancel();
        let deadline = Instant::now() + grace;
        for (name, mut handle) in self.samplers {
            match timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(task = name, error = %e, "sampler task failed"),
                Err(_) => {
                    warn!(task = name, "sampler did not stop within grace period; aborting");
                    handle.abort();
                    let _ = handle.await;
                }
            }
        }

        self.persist_cancel.cancel();
        match self.persistence.await {
            Ok(report) => report,
            Err(e) => {
                warn!(error = %e, "persistence task failed");
                PersistenceReport::default()
            }
        }
    }
}
