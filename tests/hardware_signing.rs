//! Hardware wallet signing through the prepare job, the mock device and a
//! scripted bridge process.

use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use k256::ecdsa::SigningKey;
use rand::rngs::OsRng;
use tempfile::TempDir;
use ufx_prepare::config::{CliOverrides, PrepareConfig};
use ufx_prepare::signer::hardware::{
    DeviceCommand, DeviceEvent, HardwareSigner, MockDevice, SigningFailure, PIN_KEYPAD_HELP, PLUG_IN_MESSAGE,
};
use ufx_prepare::signer::{message_for_hash, PublicKey, SignerError};
use ufx_prepare::{read_index, verify, GdiffEngine, PrepareError, PrepareJob, ScriptedConsole, WorkingDir};
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

fn working_dir() -> (TempDir, PrepareConfig) {
    let dir = TempDir::new().unwrap();
    let layout = WorkingDir::new(dir.path());
    fs::create_dir_all(layout.builds()).unwrap();
    for version in 1..=2 {
        let mut writer = ZipWriter::new(File::create(layout.artifact(version)).unwrap());
        writer
            .start_file("app/Main.class", SimpleFileOptions::default())
            .unwrap();
        writer
            .write_all(format!("release {} ", version).repeat(30).as_bytes())
            .unwrap();
        writer
            .start_file("update-description.txt", SimpleFileOptions::default())
            .unwrap();
        writer.write_all(format!("Release {}", version).as_bytes()).unwrap();
        writer.finish().unwrap();
    }

    let config = PrepareConfig::resolve(
        dir.path(),
        CliOverrides {
            urls: vec!["https://updates.example.com/".to_string()],
            hardware: Some(None),
            ..Default::default()
        },
    )
    .unwrap();
    (dir, config)
}

fn public_key(key: &SigningKey) -> PublicKey {
    PublicKey::from_verifying_key(key.verifying_key().clone())
}

#[test]
fn test_device_signs_after_pin() {
    let (dir, config) = working_dir();
    let key = SigningKey::random(&mut OsRng);
    let console = ScriptedConsole::new(["1234"]);
    let mut signer = HardwareSigner::new(MockDevice::responsive(key.clone()).with_pin("1234"), &console, None);

    let report = PrepareJob::new(&config, &console, &GdiffEngine)
        .run_with_signer(&mut signer)
        .unwrap();

    assert_eq!(report.signing_key, public_key(&key));
    let (signed, _) = read_index(&WorkingDir::new(dir.path()).index()).unwrap();
    assert_eq!(verify(&signed).unwrap(), vec![public_key(&key)]);

    let transcript = console.transcript();
    assert!(transcript.contains(&PIN_KEYPAD_HELP.to_string()));
    assert!(transcript.contains(&"PIN: ".to_string()));

    let commands = signer.device().commands();
    let DeviceCommand::SignMessage { message, .. } = &commands[0] else {
        panic!("first command was {:?}", commands[0]);
    };
    assert_eq!(message.len(), 64);
    assert!(message.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    assert!(commands.contains(&DeviceCommand::ProvidePin("1234".to_string())));
    assert_eq!(commands.last(), Some(&DeviceCommand::Stop));
}

#[test]
fn test_expected_key_checked() {
    let (dir, config) = working_dir();
    let device_key = SigningKey::random(&mut OsRng);
    let other = public_key(&SigningKey::random(&mut OsRng));
    let console = ScriptedConsole::default();
    let mut signer = HardwareSigner::new(MockDevice::responsive(device_key), &console, Some(other));

    let err = PrepareJob::new(&config, &console, &GdiffEngine)
        .run_with_signer(&mut signer)
        .unwrap_err();

    assert!(matches!(
        err,
        PrepareError::Manifest(ufx_prepare::ManifestError::Signer(SignerError::Protocol(
            SigningFailure::MismatchedKey { .. }
        )))
    ));
    assert_eq!(err.exit_code(), 4);
    assert!(!WorkingDir::new(dir.path()).index().exists());
}

#[test]
fn test_device_without_wallet() {
    let (dir, config) = working_dir();
    let console = ScriptedConsole::default();
    let mut signer = HardwareSigner::new(MockDevice::empty(), &console, None);

    let err = PrepareJob::new(&config, &console, &GdiffEngine)
        .run_with_signer(&mut signer)
        .unwrap_err();

    assert_eq!(err.exit_code(), 4);
    assert!(err
        .to_string()
        .contains("you need to have created a wallet on your TREZOR first"));
    assert!(!WorkingDir::new(dir.path()).index().exists());
}

#[test]
fn test_unplugged_device_prompts_then_disconnects() {
    let (_dir, config) = working_dir();
    let console = ScriptedConsole::default();
    let device = MockDevice::scripted(vec![
        DeviceEvent::Detached,
        DeviceEvent::Ready { wallet_present: true },
        DeviceEvent::Detached,
    ]);
    let mut signer = HardwareSigner::new(device, &console, None);

    let err = PrepareJob::new(&config, &console, &GdiffEngine)
        .run_with_signer(&mut signer)
        .unwrap_err();

    assert!(err.to_string().contains("device was disconnected"));
    assert!(console.transcript().contains(&PLUG_IN_MESSAGE.to_string()));
}

#[test]
fn test_message_is_hex_of_hash() {
    let hash = [0xABu8; 32];
    assert_eq!(message_for_hash(&hash), "ab".repeat(32));
}

#[cfg(unix)]
mod bridge {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use ufx_prepare::config::SigningBackend;

    /// Write an executable bridge script that answers with `events` after
    /// reading one command per event.
    fn bridge_script(dir: &Path, body: &str) -> String {
        let path = dir.join("bridge.sh");
        fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path.display().to_string()
    }

    fn with_bridge(mut config: PrepareConfig, command: String) -> PrepareConfig {
        if let SigningBackend::Hardware { bridge, .. } = &mut config.signing {
            *bridge = command;
        }
        config
    }

    #[test]
    fn test_bridge_without_wallet() {
        let (dir, config) = working_dir();
        let script = bridge_script(
            dir.path(),
            r#"printf '{"event":"ready","wallet_present":false}\n'
read line"#,
        );
        let config = with_bridge(config, script);
        let console = ScriptedConsole::default();

        let err = PrepareJob::new(&config, &console, &GdiffEngine).run().unwrap_err();
        assert!(matches!(
            err,
            PrepareError::Manifest(ufx_prepare::ManifestError::Signer(SignerError::Protocol(
                SigningFailure::NoKeysOnDevice
            )))
        ));
    }

    #[test]
    fn test_bridge_unexpected_pin_request() {
        let (dir, config) = working_dir();
        let script = bridge_script(
            dir.path(),
            r#"printf '{"event":"ready","wallet_present":true}\n'
read command
printf '{"event":"pin_requested","kind":"new_first"}\n'
read line"#,
        );
        let config = with_bridge(config, script);
        let console = ScriptedConsole::default();

        let err = PrepareJob::new(&config, &console, &GdiffEngine).run().unwrap_err();
        assert!(matches!(
            err,
            PrepareError::Manifest(ufx_prepare::ManifestError::Signer(SignerError::Protocol(
                SigningFailure::UnexpectedPinRequest(_)
            )))
        ));
        assert_eq!(err.exit_code(), 4);
    }

    #[test]
    fn test_bridge_exits_early() {
        let (dir, config) = working_dir();
        let script = bridge_script(dir.path(), "exit 0");
        let config = with_bridge(config, script);
        let console = ScriptedConsole::default();

        let err = PrepareJob::new(&config, &console, &GdiffEngine).run().unwrap_err();
        assert_eq!(err.exit_code(), 4);
        assert!(!WorkingDir::new(dir.path()).index().exists());
    }

    #[test]
    fn test_missing_bridge_program() {
        let (dir, config) = working_dir();
        let config = with_bridge(config, dir.path().join("no-such-bridge").display().to_string());
        let console = ScriptedConsole::default();

        let err = PrepareJob::new(&config, &console, &GdiffEngine).run().unwrap_err();
        assert_eq!(err.exit_code(), 1);
        let layout = WorkingDir::new(dir.path());
        assert!(!layout.processed().exists());
        assert!(!layout.site().exists());
    }
}
