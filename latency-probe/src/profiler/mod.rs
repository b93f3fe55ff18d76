pub mod buffer;
pub mod clock;
pub mod collector;
pub mod config;
pub mod control;
pub mod counters;
pub mod error;
pub mod events;
pub mod format;
pub mod probe;
pub mod reader;
pub mod recorder;
pub mod report;
pub mod stats;
pub mod transaction;
pub mod writer;

pub use clock::Calibration;
pub use config::{OverflowPolicy, ProfilerConfig, TraceOutput};
pub use control::{
    ControlHandle, ControlRequest, ControlResponse, ResponseStatus, Status, ThreadStatus,
};
pub use counters::CounterKind;
pub use error::{ControlError, DecodeFailure, FormatError, HardwareError, RegistryError};
pub use events::ProbeEvent;
pub use format::TraceHeader;
pub use probe::{Probe, ProbeId, ProbeInfo, ProbeRegistry, ProbeRegistryBuilder};
pub use reader::{DecodedTrace, TraceReader, decode, decode_file, interleave_by_time};
pub use recorder::{Profiler, ProfilerBuilder, SessionId, SessionSummary, WriterFactory};
pub use report::{Analysis, analyze, print_report};
pub use stats::{Aggregator, LatencyStat, LatencySummary, ProbePair, Report};
pub use transaction::{
    Completion, Diagnostic, ReentryPolicy, TransactionInstance, TransactionTracker,
    TransactionType, reconstruct,
};
pub use writer::{NullWriter, RotatingWriter, SimpleBinaryWriter, TraceWriter};
