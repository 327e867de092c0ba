mod visitor;

pub use visitor::{Error as VisitorError, TaskError, VisitResult, Visitor};
