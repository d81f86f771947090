/// Errors that can occur within the routing layer.
#[derive(Debug, thiserror::Error)]
pub enum RoutingError {
    #[error("no route found from {from} to {to}")]
    NoRoute { from: String, to: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_route_display() {
        let err = RoutingError::NoRoute {
            from: "a".into(),
            to: "c".into(),
        };
        assert_eq!(err.to_string(), "no route found from a to c");
    }
}
