mod event_processor;

pub use event_processor::EventProcessor;
