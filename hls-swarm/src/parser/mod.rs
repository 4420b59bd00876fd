//! Line parsers that sit downstream of the lossy pipelines.

mod event;
mod progress;

pub use event::{
    basename, classify_url, Event, EventParser, EventSink, SegmentSizeLookup, TcpFailReason,
    UrlKind,
};
pub use progress::{ProgressParser, ProgressState, ProgressUpdate};
