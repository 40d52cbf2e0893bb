//! Service layer for metering-service.

pub mod aggregator;
pub mod alerts;
pub mod clock;
pub mod database;
pub mod events;
pub mod gate;
pub mod hot_store;
pub mod ledger;
pub mod meter;
pub mod metrics;
pub mod registry;
pub mod scheduler;

pub use aggregator::WindowAggregator;
pub use alerts::AlertEvaluator;
pub use clock::{Clock, ManualClock, SystemClock};
pub use database::Database;
pub use events::{event_channel, EventWriter};
pub use gate::{EventFields, FallbackMode, QuotaGate};
pub use hot_store::{CounterStore, InMemoryCounterStore, RedisCounterStore};
pub use ledger::{InMemoryLedger, InMemoryPolicyStore, PolicyStore, UsageLedger};
pub use meter::UsageMeter;
pub use metrics::{get_metrics, init_metrics};
pub use registry::{PlanResolver, PolicyRegistry, StaticPlanResolver};
pub use scheduler::{FlushOutcome, FlushScheduler};
