// Load Logger core
// Concurrent acquisition of laser + IMU lines from several serial ports

pub mod acquisition;
pub mod config;
pub mod error;
pub mod events;
pub mod link;
pub mod parser;
pub mod reader;
pub mod router;
pub mod session_log;
pub mod status;
pub mod store;
pub mod types;
pub mod weights;

pub use acquisition::Acquisition;
pub use config::AcquisitionConfig;
pub use error::{CoreResult, LoggerError};
pub use events::{AcceptedSample, CoreEvent, EVENT_BACKLOG};
pub use link::{ChannelOpener, LineLink, LinkFeeder, LinkOpener, SerialOpener};
pub use parser::{parse_line, FieldIndex, FieldLayout, ParseError, RawSample};
pub use reader::{PortReader, ReaderState};
pub use router::{PortSnapshot, SampleRouter};
pub use status::LiveStatus;
pub use store::{Metric, SeriesPoint, TimeSeriesStore};
pub use types::{PortId, Sample};
pub use weights::{WeightGrid, WEIGHT_STEP};
