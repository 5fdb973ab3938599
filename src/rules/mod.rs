//! Keyword rules used to classify memory text

mod keywords;

pub use keywords::KeywordRule;
