//! Protocol code → connector executable.

/// One entry per protocol code the fleet knows how to run
pub const PROTOCOL_MODULES: &[(&str, &str)] = &[
    ("mtc", "conduit-modbus-tcp"),
    ("mts", "conduit-modbus-tcp-server"),
    ("mvc", "conduit-modbus-rtu-tcp"),
    ("mvs", "conduit-modbus-rtu-tcp-server"),
    ("mrc", "conduit-modbus-rtu"),
    ("mrs", "conduit-modbus-rtu-server"),
    ("ouc", "conduit-opcua"),
    ("ous", "conduit-opcua-server"),
    ("mqc", "conduit-mqtt"),
    ("mqs", "conduit-mqtt-broker"),
    ("kfc", "conduit-kafka"),
    ("kfs", "conduit-kafka-server"),
    ("rdc", "conduit-rdb"),
    ("rac", "conduit-rest"),
    ("ras", "conduit-rest-server"),
];

pub fn resolve_module(protocol: &str) -> Option<&'static str> {
    PROTOCOL_MODULES
        .iter()
        .find(|(code, _)| *code == protocol)
        .map(|(_, module)| *module)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_resolve_known_and_unknown() {
        assert_eq!(resolve_module("mtc"), Some("conduit-modbus-tcp"));
        assert_eq!(resolve_module("ras"), Some("conduit-rest-server"));
        assert_eq!(resolve_module("MTC"), None);
        assert_eq!(resolve_module("xyz"), None);
    }

    #[test]
    fn test_table_has_no_duplicates() {
        let codes: HashSet<_> = PROTOCOL_MODULES.iter().map(|(c, _)| c).collect();
        let modules: HashSet<_> = PROTOCOL_MODULES.iter().map(|(_, m)| m).collect();
        assert_eq!(codes.len(), 15);
        assert_eq!(modules.len(), 15);
    }
}
