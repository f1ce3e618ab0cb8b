use clap::Parser;
use conduit_core::models::is_valid_conn_id;

/// Command line shared by every connector module. Parsed once at startup.
#[derive(Debug, Clone, Parser)]
#[command(version, about = "Conduit protocol connector")]
pub struct ConnectorArgs {
    /// Connection id served by this process
    #[arg(long = "conn-id", env = "CONDUIT_CONN_ID", value_parser = parse_conn_id)]
    pub conn_id: String,

    /// Start from a clean bus session
    #[arg(long)]
    pub clean: bool,

    /// Debug diagnostics
    #[arg(short, long)]
    pub verbose: bool,
}

fn parse_conn_id(raw: &str) -> Result<String, String> {
    if is_valid_conn_id(raw) {
        Ok(raw.to_string())
    } else {
        Err(format!("invalid connection id '{raw}'"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_style_argument() {
        let args = ConnectorArgs::try_parse_from(["conduit-modbus-tcp", "--conn-id=mtc-01"]).unwrap();
        assert_eq!(args.conn_id, "mtc-01");
        assert!(!args.clean);
        assert!(!args.verbose);
    }

    #[test]
    fn test_flags() {
        let args =
            ConnectorArgs::try_parse_from(["x", "--conn-id", "mtc-01", "--clean", "-v"]).unwrap();
        assert!(args.clean);
        assert!(args.verbose);
    }

    #[test]
    fn test_rejects_unsafe_id() {
        assert!(ConnectorArgs::try_parse_from(["x", "--conn-id=../../etc"]).is_err());
    }
}
