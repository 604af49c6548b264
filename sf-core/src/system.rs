//! External tool invocation
//!
//! Implements the management-controller, identification and drive-probe
//! seams on top of `ipmitool`, `dmidecode` and `nvme`. Every invocation is
//! bounded by a timeout and its failure is classified for the retry logic.

use std::io::Read;
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::constants::{timing, tools};
use crate::data::IpmiSettings;
use crate::ipmi::{format_request, BoardIdentitySource, DriveProbe, IpmiTransport};
use crate::sensors::parse_nvme_devices;
use sf_error::{Result, SuperfanError};

// ============================================================================
// Process Execution
// ============================================================================

/// Map a failed invocation's stderr onto the error taxonomy
pub fn classify_failure(command: &str, stderr: &str) -> SuperfanError {
    let lower = stderr.to_ascii_lowercase();
    // completion codes: 0xc0 node busy, 0xc3 timeout while processing
    if lower.contains("device or resource busy")
        || lower.contains("resource temporarily unavailable")
        || lower.contains("node busy")
        || lower.contains("rsp=0xc0")
    {
        SuperfanError::TransportBusy(stderr.trim().to_string())
    } else if lower.contains("error in open session")
        || lower.contains("unable to establish")
        || lower.contains("could not open device")
        || lower.contains("connection refused")
    {
        SuperfanError::Transport(stderr.trim().to_string())
    } else if lower.contains("timeout") || lower.contains("timed out") || lower.contains("rsp=0xc3") {
        SuperfanError::Timeout(format!("{}: {}", command, stderr.trim()))
    } else {
        SuperfanError::CommandFailed {
            command: command.to_string(),
            reason: stderr.trim().to_string(),
        }
    }
}

/// Read a pipe to the end on a helper thread
fn drain<R: Read + Send + 'static>(pipe: Option<R>, stream: &'static str) -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut out = String::new();
        if let Some(mut pipe) = pipe {
            if let Err(e) = pipe.read_to_string(&mut out) {
                debug!(stream, "Tool output unreadable: {}", e);
            }
        }
        // receiver may have given up already
        let _ = tx.send(out);
    });
    rx
}

/// Collect drained output. A grandchild holding the pipe open must not
/// stall the caller past the grace period.
fn collect(rx: &mpsc::Receiver<String>, command: &str, stream: &'static str) -> String {
    match rx.recv_timeout(Duration::from_millis(timing::PIPE_DRAIN_MS)) {
        Ok(out) => out,
        Err(_) => {
            warn!(command = %command, stream, "Tool output still open after exit, ignoring it");
            String::new()
        }
    }
}

/// Run a program, returning stdout on success. The child is killed when
/// `timeout` elapses.
pub fn run_tool(program: &str, args: &[String], timeout: Duration) -> Result<String> {
    let label = format!("{} {}", program, args.join(" "));
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| SuperfanError::CommandFailed {
            command: program.to_string(),
            reason: e.to_string(),
        })?;

    let stdout = drain(child.stdout.take(), "stdout");
    let stderr = drain(child.stderr.take(), "stderr");

    let started = Instant::now();
    let status = loop {
        match child.try_wait()? {
            Some(status) => break status,
            None if started.elapsed() >= timeout => {
                let _ = child.kill();
                let _ = child.wait();
                warn!(command = %label, "Tool invocation exceeded {:?}", timeout);
                return Err(SuperfanError::Timeout(label));
            }
            None => thread::sleep(Duration::from_millis(timing::CHILD_POLL_MS)),
        }
    };

    let stdout = collect(&stdout, &label, "stdout");
    let stderr = collect(&stderr, &label, "stderr");

    if status.success() {
        Ok(stdout)
    } else {
        debug!(command = %label, status = ?status.code(), "Tool invocation failed");
        Err(classify_failure(&label, &stderr))
    }
}

/// Parse `ipmitool raw` output (` 01 ff`) into bytes
pub fn parse_raw_response(request: &[u8], output: &str) -> Result<Vec<u8>> {
    output
        .split_whitespace()
        .map(|tok| {
            let hex = tok.trim_start_matches("0x");
            u8::from_str_radix(hex, 16).map_err(|_| {
                SuperfanError::malformed(format_request(request), format!("non-hex token {:?}", tok))
            })
        })
        .collect()
}

// ============================================================================
// ipmitool
// ============================================================================

/// `ipmitool` transport, in-band for localhost or over the network otherwise
pub struct IpmitoolTransport {
    base_args: Vec<String>,
    timeout: Duration,
}

impl IpmitoolTransport {
    pub fn new(settings: &IpmiSettings) -> Self {
        let base_args = if settings.is_local() {
            Vec::new()
        } else {
            vec![
                "-I".to_string(),
                settings.interface.clone(),
                "-H".to_string(),
                settings.host.clone(),
                "-U".to_string(),
                settings.username.clone(),
                "-P".to_string(),
                settings.password.clone(),
            ]
        };
        Self {
            base_args,
            timeout: Duration::from_millis(settings.command_timeout_ms),
        }
    }

    fn run(&self, extra: &[&str]) -> Result<String> {
        let mut args = self.base_args.clone();
        args.extend(extra.iter().map(|s| s.to_string()));
        run_tool(tools::IPMITOOL, &args, self.timeout)
    }
}

impl IpmiTransport for IpmitoolTransport {
    fn raw(&mut self, request: &[u8]) -> Result<Vec<u8>> {
        let bytes: Vec<String> = request.iter().map(|b| format!("0x{:02x}", b)).collect();
        let mut extra = vec!["raw"];
        extra.extend(bytes.iter().map(String::as_str));
        let output = self.run(&extra)?;
        parse_raw_response(request, &output)
    }

    fn sdr_list(&mut self) -> Result<String> {
        self.run(&["sdr", "list"])
    }

    fn mc_info(&mut self) -> Result<String> {
        self.run(&["mc", "info"])
    }
}

// ============================================================================
// dmidecode / nvme
// ============================================================================

/// Baseboard identification through `dmidecode -t baseboard`
pub struct DmiDecode {
    timeout: Duration,
}

impl DmiDecode {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl BoardIdentitySource for DmiDecode {
    fn baseboard_text(&self) -> Result<String> {
        run_tool(
            tools::DMIDECODE,
            &["-t".to_string(), "baseboard".to_string()],
            self.timeout,
        )
    }
}

/// Drive temperatures through `nvme list` / `nvme smart-log`
pub struct NvmeCli {
    timeout: Duration,
}

impl NvmeCli {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl DriveProbe for NvmeCli {
    fn list_devices(&self) -> Result<Vec<String>> {
        let output = run_tool(tools::NVME, &["list".to_string()], self.timeout)?;
        Ok(parse_nvme_devices(&output))
    }

    fn smart_log(&self, device: &str) -> Result<String> {
        run_tool(
            tools::NVME,
            &["smart-log".to_string(), device.to_string()],
            self.timeout,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_failure() {
        assert!(matches!(
            classify_failure("ipmitool raw", "Unable to send RAW command: Device or resource busy"),
            SuperfanError::TransportBusy(_)
        ));
        assert!(matches!(
            classify_failure("ipmitool raw", "Error in open session response message"),
            SuperfanError::Transport(_)
        ));
        assert!(matches!(
            classify_failure(
                "ipmitool raw 0x30 0x45 0x00",
                "Unable to send RAW command (channel=0x0 netfn=0x30 lun=0x0 cmd=0x45 rsp=0xc0): Node busy"
            ),
            SuperfanError::TransportBusy(_)
        ));
        assert!(classify_failure("ipmitool raw", "(rsp=0xc0): Node busy").is_transient());
        assert!(matches!(
            classify_failure(
                "ipmitool raw 0x30 0x45 0x00",
                "Unable to send RAW command (channel=0x0 netfn=0x30 lun=0x0 cmd=0x45 rsp=0xc3): Timeout while processing command"
            ),
            SuperfanError::Timeout(_)
        ));
        assert!(matches!(
            classify_failure("ipmitool raw", "Unable to send RAW command (rsp=0xc3)"),
            SuperfanError::Timeout(_)
        ));
        assert!(matches!(
            classify_failure("ipmitool raw", "Invalid command"),
            SuperfanError::CommandFailed { .. }
        ));
    }

    #[test]
    fn test_parse_raw_response() {
        assert_eq!(parse_raw_response(&[0x30, 0x45, 0x00], " 01\n").unwrap(), vec![0x01]);
        assert_eq!(parse_raw_response(&[0x30], " 7f ff").unwrap(), vec![0x7f, 0xff]);
        assert!(parse_raw_response(&[0x30], "").unwrap().is_empty());
        assert!(matches!(
            parse_raw_response(&[0x30], "Unable"),
            Err(SuperfanError::MalformedResponse { .. })
        ));
    }

    #[test]
    fn test_remote_arguments() {
        let settings = IpmiSettings {
            host: "10.0.0.5".into(),
            username: "ADMIN".into(),
            password: "secret".into(),
            ..IpmiSettings::default()
        };
        let transport = IpmitoolTransport::new(&settings);
        assert_eq!(
            transport.base_args,
            vec!["-I", "lanplus", "-H", "10.0.0.5", "-U", "ADMIN", "-P", "secret"]
        );
        assert!(IpmitoolTransport::new(&IpmiSettings::default()).base_args.is_empty());
    }

    #[test]
    fn test_missing_program_reported() {
        let err = run_tool("superfan-no-such-tool", &[], Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, SuperfanError::CommandFailed { .. }));
        assert!(!err.is_transient());
    }

    #[cfg(unix)]
    #[test]
    fn test_timeout_kills_child() {
        let err = run_tool("sleep", &["5".to_string()], Duration::from_millis(100)).unwrap_err();
        assert!(matches!(err, SuperfanError::Timeout(_)));
    }

    #[cfg(unix)]
    #[test]
    fn test_inherited_pipe_does_not_block() {
        let started = Instant::now();
        let args = vec!["-c".to_string(), "sleep 3 & exit 0".to_string()];
        assert!(run_tool("sh", &args, Duration::from_secs(2)).is_ok());
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
