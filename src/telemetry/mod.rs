pub mod log;

pub use log::{
	FileLogSink, LogSink, NullLogSink, Outcome, RecordedErrorType, RequestLogRecorder,
};
