//! Host radio health: Bluetooth service, adapter selection and bring-up.
//!
//! All host interaction goes through [`HostControl`], which runs an external
//! program and captures its stdout. On Linux the commands are
//! `systemctl is-active|start <service>` and `hciconfig`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::error::{AdapterUnavailableReason, Error, Result};

/// Output of a host command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Whether the program exited with status zero.
    pub success: bool,
    /// Captured standard output.
    pub stdout: String,
}

impl CommandOutput {
    /// A successful run with the given stdout.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            success: true,
            stdout: stdout.into(),
        }
    }

    /// A non-zero exit with the given stdout.
    pub fn failed(stdout: impl Into<String>) -> Self {
        Self {
            success: false,
            stdout: stdout.into(),
        }
    }
}

/// Runs external programs on the host.
#[async_trait]
pub trait HostControl: Send + Sync {
    /// Run `program` with `args` and capture stdout.
    ///
    /// A non-zero exit is reported through [`CommandOutput::success`]; an
    /// `Err` means the program could not be run at all.
    async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput>;
}

/// [`HostControl`] backed by `tokio::process`.
#[derive(Debug, Clone)]
pub struct SystemHost {
    timeout: Duration,
}

impl SystemHost {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for SystemHost {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[async_trait]
impl HostControl for SystemHost {
    async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        debug!("Running {} {}", program, args.join(" "));
        let output = tokio::time::timeout(
            self.timeout,
            tokio::process::Command::new(program)
                .args(args)
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| Error::timeout(format!("{} {}", program, args.join(" ")), self.timeout))?
        .map_err(|e| Error::host_command(program, e.to_string()))?;

        Ok(CommandOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        })
    }
}

/// One host radio as reported by `hciconfig -a`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RadioInfo {
    /// The N in `hciN`.
    pub index: u32,
    /// Transport bus, e.g. `USB` or `UART`.
    pub bus: Option<String>,
    /// BD address.
    pub address: Option<String>,
    /// Manufacturer string, used for vendor matching.
    pub manufacturer: Option<String>,
    /// Whether the radio reported `UP`.
    pub up: bool,
}

impl RadioInfo {
    fn new(index: u32) -> Self {
        Self {
            index,
            bus: None,
            address: None,
            manufacturer: None,
            up: false,
        }
    }

    /// Whether the manufacturer string contains `signature`, ignoring case.
    pub fn matches_vendor(&self, signature: &str) -> bool {
        let signature = signature.to_ascii_lowercase();
        self.manufacturer
            .as_deref()
            .is_some_and(|m| m.to_ascii_lowercase().contains(&signature))
    }
}

/// Parse the block output of `hciconfig -a` (or `hciconfig hciN`).
///
/// Each block starts with an unindented `hciN:` header; the indented lines
/// that follow carry the address, the `UP`/`DOWN` flags and the manufacturer.
pub fn parse_radio_list(output: &str) -> Vec<RadioInfo> {
    let mut radios = Vec::new();

    for line in output.lines() {
        if line.trim().is_empty() {
            continue;
        }

        if !line.starts_with(char::is_whitespace) {
            let Some((name, rest)) = line.split_once(':') else {
                continue;
            };
            let Some(index) = name
                .strip_prefix("hci")
                .and_then(|n| n.trim().parse::<u32>().ok())
            else {
                continue;
            };
            let mut radio = RadioInfo::new(index);
            radio.bus = field_after(rest, "Bus:");
            radios.push(radio);
            continue;
        }

        let Some(radio) = radios.last_mut() else {
            continue;
        };
        let line = line.trim();

        if let Some(address) = field_after(line, "BD Address:") {
            radio.address = Some(address);
        } else if let Some(manufacturer) = line.strip_prefix("Manufacturer:") {
            radio.manufacturer = Some(manufacturer.trim().to_string());
        } else {
            match line.split_whitespace().next() {
                Some("UP") => radio.up = true,
                Some("DOWN") => radio.up = false,
                _ => {}
            }
        }
    }

    radios
}

fn field_after(text: &str, label: &str) -> Option<String> {
    let (_, rest) = text.split_once(label)?;
    rest.split_whitespace().next().map(str::to_string)
}

/// Settings for adapter selection and bring-up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterSettings {
    /// Operator-specified radio index; skips vendor matching.
    pub index: Option<u32>,
    /// Manufacturer substring identifying the preferred dongle.
    pub vendor_signature: String,
    /// Name of the OS Bluetooth service unit.
    pub service: String,
    /// Pause after starting the service before re-checking it.
    pub grace: Duration,
}

impl Default for AdapterSettings {
    fn default() -> Self {
        Self {
            index: None,
            vendor_signature: "Cambridge Silicon Radio".to_string(),
            service: "bluetooth".to_string(),
            grace: Duration::from_secs(1),
        }
    }
}

/// Result of an adapter recovery attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum RecoveryOutcome {
    /// The bound radio is usable again.
    Recovered { index: u32 },
    /// A usable radio exists, but at a different index than the one the
    /// platform stack was bound to at startup.
    RestartRequired { bound: u32, resolved: u32 },
    /// Some step failed; try again later.
    Failed { reason: String },
}

/// Recovers the host radio after it reports powered-off.
#[async_trait]
pub trait AdapterRecovery: Send + Sync {
    async fn recover(&self) -> RecoveryOutcome;
}

/// Keeps a usable, powered radio available.
pub struct AdapterHealthManager {
    host: Arc<dyn HostControl>,
    settings: AdapterSettings,
    bound: Option<u32>,
}

impl std::fmt::Debug for AdapterHealthManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterHealthManager")
            .field("settings", &self.settings)
            .field("bound", &self.bound)
            .finish()
    }
}

impl AdapterHealthManager {
    pub fn new(host: Arc<dyn HostControl>, settings: AdapterSettings) -> Self {
        Self {
            host,
            settings,
            bound: None,
        }
    }

    pub fn settings(&self) -> &AdapterSettings {
        &self.settings
    }

    /// The radio index the process bound to in [`initialize`](Self::initialize).
    pub fn bound_index(&self) -> Option<u32> {
        self.bound
    }

    /// All radios known to the host.
    pub async fn list_radios(&self) -> Result<Vec<RadioInfo>> {
        let output = self.host.run("hciconfig", &["-a"]).await?;
        if !output.success {
            return Err(Error::host_command("hciconfig", "listing radios failed"));
        }
        Ok(parse_radio_list(&output.stdout))
    }

    /// Pick the radio to use.
    ///
    /// A configured index wins unconditionally. Otherwise the first radio
    /// whose manufacturer matches the vendor signature, then the first radio
    /// reporting up.
    pub async fn resolve_preferred_adapter(&self) -> Result<u32> {
        if let Some(index) = self.settings.index {
            debug!("Using configured adapter hci{}", index);
            return Ok(index);
        }

        let radios = self.list_radios().await?;
        if let Some(radio) = radios
            .iter()
            .find(|r| r.matches_vendor(&self.settings.vendor_signature))
        {
            debug!(
                "Selected hci{} by vendor '{}'",
                radio.index, self.settings.vendor_signature
            );
            return Ok(radio.index);
        }
        if let Some(radio) = radios.iter().find(|r| r.up) {
            info!(
                "No radio matches '{}', falling back to hci{}",
                self.settings.vendor_signature, radio.index
            );
            return Ok(radio.index);
        }

        Err(Error::AdapterUnavailable(AdapterUnavailableReason::NoAdapter))
    }

    async fn service_active(&self) -> bool {
        match self
            .host
            .run("systemctl", &["is-active", &self.settings.service])
            .await
        {
            Ok(output) => output.stdout.trim() == "active",
            Err(e) => {
                warn!("Could not query {}: {}", self.settings.service, e);
                false
            }
        }
    }

    /// Make sure the OS Bluetooth service is active, starting it if needed.
    pub async fn ensure_service_running(&self) -> Result<()> {
        if self.service_active().await {
            return Ok(());
        }

        warn!(
            "Bluetooth service '{}' not running, attempting to start",
            self.settings.service
        );
        match self
            .host
            .run("systemctl", &["start", &self.settings.service])
            .await
        {
            Ok(output) if !output.success => {
                warn!("systemctl start {} exited non-zero", self.settings.service)
            }
            Ok(_) => {}
            Err(e) => warn!("Failed to start {}: {}", self.settings.service, e),
        }
        tokio::time::sleep(self.settings.grace).await;

        if self.service_active().await {
            info!("Bluetooth service '{}' started", self.settings.service);
            Ok(())
        } else {
            Err(Error::AdapterUnavailable(
                AdapterUnavailableReason::ServiceInactive {
                    service: self.settings.service.clone(),
                },
            ))
        }
    }

    async fn adapter_is_up(&self, index: u32) -> Result<bool> {
        let name = format!("hci{}", index);
        let output = self.host.run("hciconfig", &[&name]).await?;
        Ok(parse_radio_list(&output.stdout)
            .into_iter()
            .any(|r| r.index == index && r.up))
    }

    /// Make sure radio `index` is up, issuing a bring-up if it is down.
    pub async fn ensure_adapter_up(&self, index: u32) -> Result<()> {
        if self.adapter_is_up(index).await? {
            return Ok(());
        }

        let name = format!("hci{}", index);
        info!("{} is down, bringing it up", name);
        let output = self.host.run("hciconfig", &[&name, "up"]).await?;
        if !output.success {
            warn!("hciconfig {} up exited non-zero", name);
        }

        if self.adapter_is_up(index).await? {
            Ok(())
        } else {
            Err(Error::AdapterUnavailable(
                AdapterUnavailableReason::AdapterDown { index },
            ))
        }
    }

    /// Service, selection and bring-up, in that order. Binds the process to
    /// the returned index.
    #[instrument(skip(self))]
    pub async fn initialize(&mut self) -> Result<u32> {
        self.ensure_service_running().await?;
        let index = self.resolve_preferred_adapter().await?;
        self.ensure_adapter_up(index).await?;
        info!("Using Bluetooth adapter hci{}", index);
        self.bound = Some(index);
        Ok(index)
    }
}

#[async_trait]
impl AdapterRecovery for AdapterHealthManager {
    #[instrument(skip(self))]
    async fn recover(&self) -> RecoveryOutcome {
        let resolved = async {
            self.ensure_service_running().await?;
            let index = self.resolve_preferred_adapter().await?;
            self.ensure_adapter_up(index).await?;
            Ok::<_, Error>(index)
        }
        .await;

        match (resolved, self.bound) {
            (Ok(resolved), Some(bound)) if resolved != bound => {
                warn!(
                    "Adapter re-enumerated as hci{} but the BLE stack is bound to hci{}; process restart required",
                    resolved, bound
                );
                RecoveryOutcome::RestartRequired { bound, resolved }
            }
            (Ok(index), _) => {
                info!("Adapter hci{} recovered", index);
                RecoveryOutcome::Recovered { index }
            }
            (Err(e), _) => {
                warn!("Adapter recovery failed: {}", e);
                RecoveryOutcome::Failed {
                    reason: e.to_string(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockHost;

    const HCICONFIG_TWO_RADIOS: &str = "\
hci1:\tType: Primary  Bus: USB
\tBD Address: 00:1A:7D:DA:71:13  ACL MTU: 310:10  SCO MTU: 64:8
\tUP RUNNING
\tRX bytes:1234 acl:0 sco:0 events:56 errors:0
\tTX bytes:789 acl:0 sco:0 commands:45 errors:0
\tManufacturer: Cambridge Silicon Radio (10)

hci0:\tType: Primary  Bus: UART
\tBD Address: B8:27:EB:12:34:56  ACL MTU: 1021:8  SCO MTU: 64:1
\tDOWN
\tRX bytes:0 acl:0 sco:0 events:0 errors:0
\tManufacturer: Cypress Semiconductor (305)
";

    fn radio_block(index: u32, up: bool) -> String {
        format!(
            "hci{}:\tType: Primary  Bus: USB\n\tBD Address: 00:1A:7D:DA:71:13  ACL MTU: 310:10\n\t{}\n",
            index,
            if up { "UP RUNNING" } else { "DOWN" }
        )
    }

    fn manager(host: &Arc<MockHost>, settings: AdapterSettings) -> AdapterHealthManager {
        AdapterHealthManager::new(host.clone(), settings)
    }

    #[test]
    fn test_parse_radio_list() {
        let radios = parse_radio_list(HCICONFIG_TWO_RADIOS);
        assert_eq!(radios.len(), 2);

        assert_eq!(radios[0].index, 1);
        assert_eq!(radios[0].bus.as_deref(), Some("USB"));
        assert_eq!(radios[0].address.as_deref(), Some("00:1A:7D:DA:71:13"));
        assert!(radios[0].up);
        assert!(radios[0].matches_vendor("cambridge silicon"));

        assert_eq!(radios[1].index, 0);
        assert_eq!(radios[1].bus.as_deref(), Some("UART"));
        assert!(!radios[1].up);
        assert!(!radios[1].matches_vendor("Cambridge"));
    }

    #[test]
    fn test_parse_radio_list_empty_and_garbage() {
        assert!(parse_radio_list("").is_empty());
        assert!(parse_radio_list("Can't get device info: No such device\n").is_empty());
    }

    #[tokio::test]
    async fn test_resolve_prefers_configured_index() {
        let host = Arc::new(MockHost::new());
        let settings = AdapterSettings {
            index: Some(3),
            ..Default::default()
        };
        assert_eq!(manager(&host, settings).resolve_preferred_adapter().await.unwrap(), 3);
        assert!(host.calls().is_empty());
    }

    #[tokio::test]
    async fn test_resolve_by_vendor_signature() {
        let host = Arc::new(MockHost::new());
        host.respond("hciconfig -a", CommandOutput::ok(HCICONFIG_TWO_RADIOS));
        let index = manager(&host, AdapterSettings::default())
            .resolve_preferred_adapter()
            .await
            .unwrap();
        assert_eq!(index, 1);
    }

    #[tokio::test]
    async fn test_resolve_falls_back_to_up_radio() {
        let host = Arc::new(MockHost::new());
        let listing = format!("{}\n{}", radio_block(0, false), radio_block(2, true));
        host.respond("hciconfig -a", CommandOutput::ok(listing));
        let index = manager(&host, AdapterSettings::default())
            .resolve_preferred_adapter()
            .await
            .unwrap();
        assert_eq!(index, 2);
    }

    #[tokio::test]
    async fn test_resolve_none() {
        let host = Arc::new(MockHost::new());
        host.respond("hciconfig -a", CommandOutput::ok(radio_block(0, false)));
        let err = manager(&host, AdapterSettings::default())
            .resolve_preferred_adapter()
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::AdapterUnavailable(AdapterUnavailableReason::NoAdapter)
        ));
    }

    #[tokio::test]
    async fn test_service_already_active() {
        let host = Arc::new(MockHost::new());
        host.respond("systemctl is-active bluetooth", CommandOutput::ok("active\n"));
        manager(&host, AdapterSettings::default())
            .ensure_service_running()
            .await
            .unwrap();
        assert_eq!(host.calls(), vec!["systemctl is-active bluetooth"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_service_started_after_grace() {
        let host = Arc::new(MockHost::new());
        host.respond_sequence(
            "systemctl is-active bluetooth",
            [CommandOutput::failed("inactive\n"), CommandOutput::ok("active\n")],
        );
        host.respond("systemctl start bluetooth", CommandOutput::ok(""));

        let start = tokio::time::Instant::now();
        manager(&host, AdapterSettings::default())
            .ensure_service_running()
            .await
            .unwrap();
        assert!(start.elapsed() >= Duration::from_secs(1));
        assert_eq!(
            host.calls(),
            vec![
                "systemctl is-active bluetooth",
                "systemctl start bluetooth",
                "systemctl is-active bluetooth",
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_service_cannot_start() {
        let host = Arc::new(MockHost::new());
        host.respond("systemctl is-active bluetooth", CommandOutput::failed("failed\n"));
        host.fail("systemctl start bluetooth");

        let err = manager(&host, AdapterSettings::default())
            .ensure_service_running()
            .await
            .unwrap_err();
        assert!(err.to_string().contains("service 'bluetooth' is not active"));
    }

    #[tokio::test]
    async fn test_adapter_brought_up() {
        let host = Arc::new(MockHost::new());
        host.respond_sequence(
            "hciconfig hci1",
            [
                CommandOutput::ok(radio_block(1, false)),
                CommandOutput::ok(radio_block(1, true)),
            ],
        );
        host.respond("hciconfig hci1 up", CommandOutput::ok(""));

        manager(&host, AdapterSettings::default())
            .ensure_adapter_up(1)
            .await
            .unwrap();
        assert!(host.calls().contains(&"hciconfig hci1 up".to_string()));
    }

    #[tokio::test]
    async fn test_adapter_stays_down() {
        let host = Arc::new(MockHost::new());
        host.respond("hciconfig hci0", CommandOutput::ok(radio_block(0, false)));
        host.respond("hciconfig hci0 up", CommandOutput::failed(""));

        let err = manager(&host, AdapterSettings::default())
            .ensure_adapter_up(0)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::AdapterUnavailable(AdapterUnavailableReason::AdapterDown { index: 0 })
        ));
    }

    fn healthy_host(listing: &str, index: u32) -> Arc<MockHost> {
        let host = Arc::new(MockHost::new());
        host.respond("systemctl is-active bluetooth", CommandOutput::ok("active"));
        host.respond("hciconfig -a", CommandOutput::ok(listing));
        host.respond(
            &format!("hciconfig hci{}", index),
            CommandOutput::ok(radio_block(index, true)),
        );
        host
    }

    #[tokio::test]
    async fn test_initialize_binds_index() {
        let host = healthy_host(HCICONFIG_TWO_RADIOS, 1);
        let mut manager = manager(&host, AdapterSettings::default());
        assert_eq!(manager.initialize().await.unwrap(), 1);
        assert_eq!(manager.bound_index(), Some(1));
    }

    #[tokio::test]
    async fn test_initialize_fails_without_radio_listing() {
        let host = Arc::new(MockHost::new());
        host.respond("systemctl is-active bluetooth", CommandOutput::ok("active"));
        host.fail("hciconfig -a");
        let mut manager = manager(&host, AdapterSettings::default());
        assert!(matches!(
            manager.initialize().await,
            Err(Error::HostCommand { .. })
        ));
        assert_eq!(manager.bound_index(), None);
    }

    #[tokio::test]
    async fn test_recover_same_index() {
        let host = healthy_host(HCICONFIG_TWO_RADIOS, 1);
        let mut manager = manager(&host, AdapterSettings::default());
        manager.initialize().await.unwrap();
        assert_eq!(
            manager.recover().await,
            RecoveryOutcome::Recovered { index: 1 }
        );
    }

    #[tokio::test]
    async fn test_recover_detects_reenumeration() {
        let host = healthy_host(HCICONFIG_TWO_RADIOS, 1);
        let mut manager = manager(&host, AdapterSettings::default());
        manager.initialize().await.unwrap();

        // Dongle comes back as hci2 after a USB reset.
        let moved = HCICONFIG_TWO_RADIOS.replace("hci1:", "hci2:");
        host.respond("hciconfig -a", CommandOutput::ok(moved));
        host.respond("hciconfig hci2", CommandOutput::ok(radio_block(2, true)));

        assert_eq!(
            manager.recover().await,
            RecoveryOutcome::RestartRequired {
                bound: 1,
                resolved: 2
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_recover_failure() {
        let host = Arc::new(MockHost::new());
        host.respond("systemctl is-active bluetooth", CommandOutput::ok("inactive"));
        host.respond("systemctl start bluetooth", CommandOutput::failed(""));
        let manager = manager(&host, AdapterSettings::default());
        assert!(matches!(
            manager.recover().await,
            RecoveryOutcome::Failed { .. }
        ));
    }

    #[test]
    fn test_outcome_serialization() {
        let json = serde_json::to_value(RecoveryOutcome::RestartRequired {
            bound: 0,
            resolved: 1,
        })
        .unwrap();
        assert_eq!(json["result"], "restart_required");
        assert_eq!(json["resolved"], 1);
    }
}
