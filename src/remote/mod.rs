//! IR remote: sending and learning codes
//!
//! One `Remote` per device owns the code library and the toggle flags.
//! Both are loaded from storage at startup and mutated in place:
//! the library by successful learns, the flags by toggle sends.

pub mod learn;
pub mod resolve;

pub use resolve::{resolve_code, CodeLibrary, ResolvedCode, StoredCode, ToggleFlags};

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::Result;
use crate::host::Notifier;
use crate::protocol::{command_frame, decode};
use crate::store::{DebouncedSave, KeyValueStore};
use crate::transport::{exchange, ReadUntil, Timeouts};

const PENDING_RESULT: &str = "Pending...";

/// What to do when a resolved command cannot be delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SendErrorPolicy {
    /// Log, skip the command and keep going with the batch
    #[default]
    Continue,
    /// Abort the batch and return the error
    Stop,
}

/// State exposed to whoever displays the remote
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RemoteAttributes {
    /// Hex of the last code delivered in a batch
    pub last_command_sent: Option<String>,
    /// Hex of the device's reply to the last send
    pub last_command_result: Option<String>,
    /// Hex of the last learned code
    pub last_learn: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RemoteSettings {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub timeouts: Timeouts,
    /// Per-read timeout while waiting for a button press
    pub learn_timeout: Duration,
    pub flag_save_delay: Duration,
    pub send_error_policy: SendErrorPolicy,
}

impl RemoteSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            name: config.device.name.clone(),
            host: config.device.host.clone(),
            port: config.device.port,
            timeouts: config.timeouts(),
            learn_timeout: Duration::from_secs(config.remote.learn_timeout_secs),
            flag_save_delay: Duration::from_secs(config.remote.flag_save_delay_secs),
            send_error_policy: config.remote.send_error_policy,
        }
    }
}

pub struct Remote {
    settings: RemoteSettings,
    codes: CodeLibrary,
    flags: ToggleFlags,
    is_on: bool,
    attributes: RemoteAttributes,
    code_store: Arc<dyn KeyValueStore>,
    flag_saver: DebouncedSave,
    notifier: Arc<dyn Notifier>,
}

impl Remote {
    pub fn new(
        settings: RemoteSettings,
        code_store: Arc<dyn KeyValueStore>,
        flag_store: Arc<dyn KeyValueStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let flag_saver = DebouncedSave::new(flag_store, settings.flag_save_delay);
        Self {
            settings,
            codes: CodeLibrary::new(),
            flags: ToggleFlags::new(),
            is_on: true,
            attributes: RemoteAttributes::default(),
            code_store,
            flag_saver,
            notifier,
        }
    }

    /// Load the code library and toggle flags from storage
    pub async fn load_storage(&mut self) -> Result<()> {
        if let Some(data) = self.code_store.load().await? {
            let codes: CodeLibrary = serde_json::from_value(data)?;
            self.codes.extend(codes);
        }
        if let Some(data) = self.flag_saver.store().load().await? {
            let flags: ToggleFlags = serde_json::from_value(data)?;
            self.flags.extend(flags);
        }
        info!(
            "{}: loaded codes for {} device(s), {} toggle flag(s)",
            self.settings.name,
            self.codes.len(),
            self.flags.len()
        );
        Ok(())
    }

    pub fn is_on(&self) -> bool {
        self.is_on
    }

    pub fn set_on(&mut self, on: bool) {
        self.is_on = on;
        info!("{} turned {}", self.settings.name, if on { "on" } else { "off" });
    }

    pub fn codes(&self) -> &CodeLibrary {
        &self.codes
    }

    pub fn flags(&self) -> &ToggleFlags {
        &self.flags
    }

    pub fn attributes(&self) -> &RemoteAttributes {
        &self.attributes
    }

    /// Send `commands` to `device`, the whole list `repeats` times
    ///
    /// Commands that cannot be resolved are logged and skipped; the
    /// next send then goes out without waiting `delay`. Returns the
    /// number of codes delivered.
    pub async fn send_command(
        &mut self,
        commands: &[String],
        device: Option<&str>,
        repeats: u32,
        delay: Duration,
    ) -> Result<usize> {
        if !self.is_on {
            warn!(
                "send_command canceled: {} is turned off",
                self.settings.name
            );
            return Ok(0);
        }

        let mut should_delay = false;
        let mut sent = 0;

        for _ in 0..repeats {
            for command in commands {
                if should_delay {
                    tokio::time::sleep(delay).await;
                }

                let (resolved, frame) = match self.prepare(command, device) {
                    Ok(prepared) => prepared,
                    Err(e) if e.is_resolution() => {
                        error!(
                            "Failed to send '{}' to {}: {}",
                            command,
                            device.unwrap_or("-"),
                            e
                        );
                        should_delay = false;
                        continue;
                    }
                    Err(e) => return Err(e),
                };

                if let Err(e) = self.transmit(&frame).await {
                    warn!("Failed to deliver '{}': {}", command, e);
                    match self.settings.send_error_policy {
                        SendErrorPolicy::Continue => continue,
                        SendErrorPolicy::Stop => {
                            self.schedule_flag_save()?;
                            return Err(e);
                        }
                    }
                }

                sent += 1;
                self.attributes.last_command_sent = Some(hex::encode(resolved.code()));
                should_delay = true;

                if let ResolvedCode::Toggle { device, .. } = &resolved {
                    *self.flags.entry(device.clone()).or_insert(0) ^= 1;
                }
            }
        }

        self.schedule_flag_save()?;
        Ok(sent)
    }

    /// Resolve `command` and build its frame
    fn prepare(&self, command: &str, device: Option<&str>) -> Result<(ResolvedCode, Vec<u8>)> {
        let resolved = resolve_code(command, device, &self.codes, &self.flags)?;
        let frame = command_frame(resolved.code())?;
        Ok((resolved, frame))
    }

    async fn transmit(&mut self, frame: &[u8]) -> Result<()> {
        self.attributes.last_command_result = Some(PENDING_RESULT.to_string());

        let reply = exchange(
            &self.settings.host,
            self.settings.port,
            frame,
            ReadUntil::FirstChunk,
            self.settings.timeouts,
        )
        .await?;

        if !reply.is_empty() {
            let result = hex::encode(&reply);
            match decode(&reply) {
                Ok(ack) => debug!(
                    "Send acknowledged: {} (payload {})",
                    result,
                    hex::encode(ack.payload())
                ),
                Err(e) => debug!("Send answered with {}: {}", result, e),
            }
            self.attributes.last_command_result = Some(result);
        }
        Ok(())
    }

    fn schedule_flag_save(&mut self) -> Result<()> {
        let data = serde_json::to_value(&self.flags)?;
        self.flag_saver.schedule(data);
        Ok(())
    }

    /// Write out toggle flags still waiting on the debounce timer
    pub async fn flush(&mut self) -> Result<()> {
        self.flag_saver.flush().await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::DeviceError;
    use crate::host::LogNotifier;
    use crate::testing::{FakeDevice, MemoryStore};
    use serde_json::json;

    pub const ACK: [u8; 5] = [0xAA, 0x00, 0x01, 0x11, 0x00];

    pub fn settings(port: u16) -> RemoteSettings {
        RemoteSettings {
            name: "Living Room".to_string(),
            host: "127.0.0.1".to_string(),
            port,
            timeouts: Timeouts {
                connect: Duration::from_secs(2),
                read: Duration::from_secs(2),
            },
            learn_timeout: Duration::from_secs(2),
            flag_save_delay: Duration::from_millis(200),
            send_error_policy: SendErrorPolicy::Continue,
        }
    }

    async fn remote_with_codes(
        settings: RemoteSettings,
        codes: serde_json::Value,
    ) -> (Remote, Arc<MemoryStore>) {
        let flag_store = Arc::new(MemoryStore::default());
        let mut remote = Remote::new(
            settings,
            Arc::new(MemoryStore::with(codes)),
            flag_store.clone(),
            Arc::new(LogNotifier),
        );
        remote.load_storage().await.unwrap();
        (remote, flag_store)
    }

    fn cmds(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_send_frames_library_code() {
        let device = FakeDevice::start(vec![ACK.to_vec()]).await;
        let (mut remote, _) =
            remote_with_codes(settings(device.port), json!({ "tv": { "mute": "41424344" } })).await;

        let sent = remote
            .send_command(&cmds(&["mute"]), Some("tv"), 1, Duration::ZERO)
            .await
            .unwrap();

        assert_eq!(sent, 1);
        assert_eq!(
            device.requests(),
            vec![vec![0xAA, 0x00, 0x08, 0x11, 0x00, 0x00, 0x04, 0x41, 0x42, 0x43, 0x44, 0xE1]]
        );
        assert_eq!(remote.attributes().last_command_sent.as_deref(), Some("41424344"));
        assert_eq!(remote.attributes().last_command_result.as_deref(), Some("aa00011100"));
        remote.flush().await.unwrap();
    }

    #[tokio::test]
    async fn test_batch_skips_unresolvable_commands() {
        let device = FakeDevice::start(vec![ACK.to_vec()]).await;
        let (mut remote, _) = remote_with_codes(
            settings(device.port),
            json!({ "tv": { "valid": "0101", "valid2": "0202" } }),
        )
        .await;

        let sent = remote
            .send_command(
                &cmds(&["valid", "unknown", "valid2"]),
                Some("tv"),
                1,
                Duration::from_millis(1),
            )
            .await
            .unwrap();

        assert_eq!(sent, 2);
        assert_eq!(device.codes_sent(), vec![vec![0x01, 0x01], vec![0x02, 0x02]]);
        remote.flush().await.unwrap();
    }

    #[tokio::test]
    async fn test_no_delay_after_unresolvable_command() {
        let device = FakeDevice::start(vec![ACK.to_vec()]).await;
        let (mut remote, _) = remote_with_codes(
            settings(device.port),
            json!({ "tv": { "valid": "0101", "valid2": "0202" } }),
        )
        .await;
        let delay = Duration::from_millis(400);

        let started = tokio::time::Instant::now();
        let sent = remote
            .send_command(&cmds(&["bad", "valid"]), Some("tv"), 1, delay)
            .await
            .unwrap();
        assert_eq!(sent, 1);
        assert!(started.elapsed() < delay, "waited {:?}", started.elapsed());

        // One pause before "bad", none between "bad" and "valid2"
        let started = tokio::time::Instant::now();
        let sent = remote
            .send_command(&cmds(&["valid", "bad", "valid2"]), Some("tv"), 1, delay)
            .await
            .unwrap();
        let elapsed = started.elapsed();
        assert_eq!(sent, 2);
        assert!(elapsed >= delay, "waited {:?}", elapsed);
        assert!(elapsed < delay * 2, "waited {:?}", elapsed);
        remote.flush().await.unwrap();
    }

    #[tokio::test]
    async fn test_oversize_code_is_skipped() {
        let device = FakeDevice::start(vec![ACK.to_vec()]).await;
        let (mut remote, _) =
            remote_with_codes(settings(device.port), json!({ "tv": { "mute": "0a" } })).await;

        let huge = "ab".repeat(65_536);
        let sent = remote
            .send_command(&[huge, "mute".to_string()], Some("tv"), 1, Duration::ZERO)
            .await
            .unwrap();

        assert_eq!(sent, 1);
        assert_eq!(device.codes_sent(), vec![vec![0x0a]]);
        remote.flush().await.unwrap();
    }

    #[tokio::test]
    async fn test_repeat_outer_command_inner() {
        let device = FakeDevice::start(vec![ACK.to_vec()]).await;
        let (mut remote, _) = remote_with_codes(
            settings(device.port),
            json!({ "tv": { "a": "0a", "b": "0b" } }),
        )
        .await;

        remote
            .send_command(&cmds(&["a", "b"]), Some("tv"), 2, Duration::ZERO)
            .await
            .unwrap();

        assert_eq!(
            device.codes_sent(),
            vec![vec![0x0a], vec![0x0b], vec![0x0a], vec![0x0b]]
        );
        remote.flush().await.unwrap();
    }

    #[tokio::test]
    async fn test_toggle_alternates_and_persists_flags() {
        let device = FakeDevice::start(vec![ACK.to_vec()]).await;
        let (mut remote, flag_store) = remote_with_codes(
            settings(device.port),
            json!({ "tv": { "power": ["aaaa", "bbbb"] } }),
        )
        .await;

        for _ in 0..3 {
            remote
                .send_command(&cmds(&["power"]), Some("tv"), 1, Duration::ZERO)
                .await
                .unwrap();
        }

        assert_eq!(
            device.codes_sent(),
            vec![vec![0xaa, 0xaa], vec![0xbb, 0xbb], vec![0xaa, 0xaa]]
        );
        assert_eq!(remote.flags().get("tv"), Some(&1));

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(flag_store.saved(), vec![json!({ "tv": 1 })]);
    }

    #[tokio::test]
    async fn test_raw_codes_need_no_device() {
        let device = FakeDevice::start(vec![ACK.to_vec()]).await;
        let (mut remote, _) = remote_with_codes(settings(device.port), json!({})).await;

        let raw = "00112233445566778899aabbccddeeff".to_string();
        let sent = remote
            .send_command(&[raw, "b64:QUJD".to_string()], None, 1, Duration::ZERO)
            .await
            .unwrap();

        assert_eq!(sent, 2);
        assert_eq!(device.codes_sent()[1], b"ABC".to_vec());
        remote.flush().await.unwrap();
    }

    #[tokio::test]
    async fn test_turned_off_sends_nothing() {
        let device = FakeDevice::start(vec![ACK.to_vec()]).await;
        let (mut remote, _) =
            remote_with_codes(settings(device.port), json!({ "tv": { "mute": "0a" } })).await;

        remote.set_on(false);
        assert!(!remote.is_on());
        let sent = remote
            .send_command(&cmds(&["mute"]), Some("tv"), 1, Duration::ZERO)
            .await
            .unwrap();

        assert_eq!(sent, 0);
        assert_eq!(device.connections(), 0);
    }

    #[tokio::test]
    async fn test_unreachable_device_continue_policy() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let (mut remote, _) =
            remote_with_codes(settings(port), json!({ "tv": { "power": ["aa", "bb"] } })).await;

        let sent = remote
            .send_command(&cmds(&["power", "power"]), Some("tv"), 1, Duration::ZERO)
            .await
            .unwrap();

        assert_eq!(sent, 0);
        assert_eq!(remote.flags().get("tv"), None);
        assert_eq!(remote.attributes().last_command_result.as_deref(), Some("Pending..."));
        remote.flush().await.unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_device_stop_policy() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut stop = settings(port);
        stop.send_error_policy = SendErrorPolicy::Stop;
        let (mut remote, _) = remote_with_codes(stop, json!({ "tv": { "mute": "0a" } })).await;

        let result = remote
            .send_command(&cmds(&["mute", "mute"]), Some("tv"), 1, Duration::ZERO)
            .await;

        assert!(matches!(result, Err(DeviceError::Connect { .. })));
        remote.flush().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_policy_keeps_codes_already_sent() {
        let device = FakeDevice::start_then_hang(vec![ACK.to_vec()]).await;
        let mut stop = settings(device.port);
        stop.send_error_policy = SendErrorPolicy::Stop;
        stop.timeouts.read = Duration::from_millis(200);
        let (mut remote, _) =
            remote_with_codes(stop, json!({ "tv": { "a": "0a", "b": "0b" } })).await;

        let result = remote
            .send_command(&cmds(&["a", "b", "a"]), Some("tv"), 1, Duration::ZERO)
            .await;

        assert!(matches!(result, Err(DeviceError::ReadTimeout { .. })));
        assert_eq!(device.connections(), 2);
        assert_eq!(remote.attributes().last_command_sent.as_deref(), Some("0a"));
        assert_eq!(remote.attributes().last_command_result.as_deref(), Some("Pending..."));
        remote.flush().await.unwrap();
    }
}
