pub mod router;

pub use router::{EventRouter, RouteHandler, RouteKey, RoutedEvent};
