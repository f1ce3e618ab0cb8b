use conduit_modbus_tcp::ModbusTcpClient;
use std::process::ExitCode;

fn main() -> ExitCode {
    conduit_connector::launch(|_| ModbusTcpClient::new())
}
