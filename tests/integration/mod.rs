//! Integration test modules for meshstore
//!
//! End-to-end scenarios that drive a [`SyncChannel`] against the in-process
//! authority: sync rounds, storage planning, reconstruction and sibling
//! contexts.

pub mod convergence;
pub mod reconstruction;
pub mod sync_scenarios;

/// Test utilities and helpers
pub mod utils {
    use meshstore::config::{ConfigBuilder, DeviceProfile, SyncConfiguration};
    use meshstore::model::{Dataset, Record};
    use meshstore::store::LocalStore;
    use meshstore::sync::{
        DatasetObserver, InMemoryAuthority, Notice, NoticeLevel, SyncChannel, TabBus,
    };
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::Duration;

    pub const COUNTRY: &str = "peru";

    /// Initialize test logging with appropriate filters
    pub fn init_test_logging() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("debug,sled=warn,hyper=warn,reqwest=warn")
            .with_test_writer()
            .try_init();
    }

    /// Create test timeout with reasonable defaults
    pub fn test_timeout() -> Duration {
        Duration::from_secs(30)
    }

    /// Record that no other generated record duplicates
    pub fn person(i: usize) -> Record {
        Record::new(format!("rec-{:05}", i), 1_700_000_000_000 + i as u64)
            .with_field("nombres", format!("Nombre {}", i))
            .with_field("apellidos", format!("Apellido {}", i))
            .with_field("edad", (i % 90) as u64)
            .with_field("departamento", "Lima")
    }

    pub fn dataset(range: std::ops::Range<usize>) -> Dataset {
        let mut dataset = Dataset::empty();
        for i in range {
            dataset.insert_record_if_absent(person(i));
        }
        dataset
    }

    pub fn authority_with(range: std::ops::Range<usize>) -> Arc<InMemoryAuthority> {
        let authority = Arc::new(InMemoryAuthority::new(50));
        authority.seed(COUNTRY, dataset(range));
        authority
    }

    pub fn config(node_id: &str, storage_threshold: usize) -> SyncConfiguration {
        ConfigBuilder::new()
            .node_id(node_id)
            .storage_threshold(storage_threshold)
            .request_timeout_ms(2_000)
            .announce(false)
            .build()
            .expect("valid test config")
    }

    #[derive(Default)]
    pub struct RecordingObserver {
        pub notices: Mutex<Vec<Notice>>,
        pub changes: Mutex<Vec<(String, usize)>>,
    }

    impl RecordingObserver {
        pub fn notices_at(&self, level: NoticeLevel) -> Vec<Notice> {
            self.notices
                .lock()
                .iter()
                .filter(|n| n.level == level)
                .cloned()
                .collect()
        }
    }

    impl DatasetObserver for RecordingObserver {
        fn on_remote_change(&self, country: &str, dataset: &Dataset) {
            self.changes
                .lock()
                .push((country.to_string(), dataset.record_count()));
        }

        fn on_notice(&self, notice: &Notice) {
            self.notices.lock().push(notice.clone());
        }
    }

    pub struct TestNode {
        pub channel: Arc<SyncChannel>,
        pub store: Arc<LocalStore>,
        pub observer: Arc<RecordingObserver>,
    }

    pub fn node_with_store(
        config: SyncConfiguration,
        store: Arc<LocalStore>,
        authority: &Arc<InMemoryAuthority>,
        bus: Option<TabBus>,
    ) -> TestNode {
        let observer = Arc::new(RecordingObserver::default());
        let mut builder = SyncChannel::builder(config)
            .with_store(store.clone())
            .with_transport(authority.clone())
            .with_observer(observer.clone())
            .with_device(DeviceProfile::desktop(8.0));
        if let Some(bus) = bus {
            builder = builder.with_bus(bus);
        }
        TestNode {
            channel: Arc::new(builder.build().expect("channel builds")),
            store,
            observer,
        }
    }

    pub fn node(config: SyncConfiguration, authority: &Arc<InMemoryAuthority>) -> TestNode {
        let store = Arc::new(LocalStore::new(config.storage.clone()));
        node_with_store(config, store, authority, None)
    }
}
