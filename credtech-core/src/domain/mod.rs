//! Domain types for the credit and indicator families.

pub mod credit;
pub mod ids;
pub mod indicator;
pub mod period;

pub use credit::{CreditAggregate, CreditKey, CreditRecord, Dimension, TOTAL_MARKER};
pub use ids::{Family, Fingerprint, RollupKey, UnitId, UnitKey};
pub use indicator::{IndicatorObservation, IndicatorPoint, IndicatorSpec, Observation, Periodicity};
pub use period::{PeriodError, ReferenceMonth};
