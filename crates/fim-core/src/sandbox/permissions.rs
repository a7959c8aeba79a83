//! Host resources granted by each [`Permission`].

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use fim_common::types::Permission;

use crate::host::HostEnv;

/// Order in which permissions are applied. `dev` comes last because it
/// supersedes every narrower `/dev` bind.
pub const APPLY_ORDER: &[Permission] = &[
    Permission::Home,
    Permission::Media,
    Permission::Audio,
    Permission::Wayland,
    Permission::Xorg,
    Permission::DbusUser,
    Permission::DbusSystem,
    Permission::Udev,
    Permission::Input,
    Permission::Usb,
    Permission::Network,
    Permission::Shm,
    Permission::Optical,
    Permission::Gpu,
    Permission::Dev,
];

/// Highest SCSI optical index scanned.
const MAX_OPTICAL_DEVICES: u32 = 256;

/// Accumulates bubblewrap arguments for granted permissions.
pub(super) struct PermissionArgs<'a> {
    pub host: &'a dyn HostEnv,
    pub xdg_runtime_dir: &'a Path,
    pub is_root: bool,
    pub args: Vec<OsString>,
}

impl PermissionArgs<'_> {
    fn bind(&mut self, flag: &str, path: impl AsRef<Path>) {
        let path = path.as_ref();
        self.args.push(flag.into());
        self.args.push(path.into());
        self.args.push(path.into());
    }

    fn setenv(&mut self, key: &str, value: impl Into<OsString>) {
        self.args.push("--setenv".into());
        self.args.push(key.into());
        self.args.push(value.into());
    }

    fn required_var(&self, permission: Permission, key: &str) -> Option<String> {
        let value = self.host.var(key).filter(|v| !v.is_empty());
        if value.is_none() {
            tracing::warn!(%permission, "{key} is undefined, skipping");
        }
        value
    }

    /// Appends the binds of `permission`.
    pub fn apply(&mut self, permission: Permission) {
        tracing::debug!(%permission, "granting permission");
        match permission {
            Permission::Home => self.home(),
            Permission::Media => {
                for dir in ["/media", "/run/media", "/mnt"] {
                    self.bind("--bind-try", dir);
                }
            }
            Permission::Audio => self.audio(),
            Permission::Wayland => self.wayland(),
            Permission::Xorg => self.xorg(),
            Permission::DbusUser => self.dbus_user(),
            Permission::DbusSystem => self.bind("--bind-try", "/run/dbus/system_bus_socket"),
            Permission::Udev => self.bind("--bind-try", "/run/udev"),
            Permission::Input => {
                self.bind("--dev-bind-try", "/dev/input");
                self.bind("--dev-bind-try", "/dev/uinput");
            }
            Permission::Usb => {
                self.bind("--dev-bind-try", "/dev/bus/usb");
                self.bind("--dev-bind-try", "/dev/usb");
            }
            Permission::Network => {
                for file in ["host.conf", "hosts", "nsswitch.conf", "resolv.conf"] {
                    self.bind("--ro-bind-try", Path::new("/etc").join(file));
                }
            }
            Permission::Shm => self.bind("--dev-bind-try", "/dev/shm"),
            Permission::Optical => self.optical(),
            Permission::Gpu => {
                self.bind("--dev-bind-try", "/dev/dri");
                for device in self.host.dev_entries("nvidia") {
                    self.bind("--dev-bind-try", device);
                }
            }
            Permission::Dev => self.bind("--dev-bind-try", "/dev"),
        }
    }

    fn home(&mut self) {
        if self.is_root {
            return;
        }
        if let Some(home) = self.required_var(Permission::Home, "HOME") {
            self.bind("--bind-try", home);
        }
    }

    fn audio(&mut self) {
        let pulse = self.xdg_runtime_dir.join("pulse/native");
        self.bind("--bind-try", &pulse);
        let mut server = OsString::from("unix:");
        server.push(&pulse);
        self.setenv("PULSE_SERVER", server);
        self.bind("--bind-try", self.xdg_runtime_dir.join("pipewire-0"));
        self.bind("--dev-bind-try", "/dev/dsp");
        self.bind("--bind-try", "/dev/snd");
        self.bind("--bind-try", "/proc/asound");
    }

    fn wayland(&mut self) {
        if let Some(display) = self.required_var(Permission::Wayland, "WAYLAND_DISPLAY") {
            self.bind("--bind-try", self.xdg_runtime_dir.join(&display));
            self.setenv("WAYLAND_DISPLAY", display);
        }
    }

    fn xorg(&mut self) {
        let Some(display) = self.required_var(Permission::Xorg, "DISPLAY") else {
            return;
        };
        let Some(xauthority) = self.required_var(Permission::Xorg, "XAUTHORITY") else {
            return;
        };
        self.bind("--ro-bind-try", &xauthority);
        self.setenv("XAUTHORITY", xauthority);
        self.setenv("DISPLAY", display);
    }

    fn dbus_user(&mut self) {
        let Some(address) = self.required_var(Permission::DbusUser, "DBUS_SESSION_BUS_ADDRESS")
        else {
            return;
        };
        if let Some(socket) = session_bus_path(&address) {
            self.bind("--bind-try", socket);
        }
        self.setenv("DBUS_SESSION_BUS_ADDRESS", address);
    }

    fn optical(&mut self) {
        for index in 0..MAX_OPTICAL_DEVICES {
            let mut any = false;
            for prefix in ["sr", "sg"] {
                let device = PathBuf::from(format!("/dev/{prefix}{index}"));
                if self.host.exists(&device) {
                    self.bind("--dev-bind-try", device);
                    any = true;
                }
            }
            if !any {
                break;
            }
        }
    }
}

/// Extracts the socket path from a `unix:path=...,guid=...` bus address.
fn session_bus_path(address: &str) -> Option<PathBuf> {
    let start = address.find('/')?;
    let path = &address[start..];
    let end = path.find(',').unwrap_or(path.len());
    Some(PathBuf::from(&path[..end]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::FixedHost;

    fn args_for(permission: Permission, host: &FixedHost, is_root: bool) -> Vec<String> {
        let mut acc = PermissionArgs {
            host,
            xdg_runtime_dir: Path::new("/run/user/1000"),
            is_root,
            args: Vec::new(),
        };
        acc.apply(permission);
        acc.args
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn every_permission_has_an_apply_slot() {
        for permission in <Permission as fim_common::types::Token>::VARIANTS {
            assert!(APPLY_ORDER.contains(permission), "{permission} missing");
        }
    }

    #[test]
    fn home_is_skipped_for_root() {
        let host = FixedHost::new(0, 0).with_var("HOME", "/root");
        assert!(args_for(Permission::Home, &host, true).is_empty());
        let host = FixedHost::new(1000, 1000).with_var("HOME", "/home/ana");
        assert_eq!(
            args_for(Permission::Home, &host, false),
            vec!["--bind-try", "/home/ana", "/home/ana"]
        );
    }

    #[test]
    fn dbus_user_binds_the_socket_path() {
        let host = FixedHost::new(1000, 1000).with_var(
            "DBUS_SESSION_BUS_ADDRESS",
            "unix:path=/run/user/1000/bus,guid=abc",
        );
        let args = args_for(Permission::DbusUser, &host, false);
        assert_eq!(&args[..3], ["--bind-try", "/run/user/1000/bus", "/run/user/1000/bus"]);
    }

    #[test]
    fn wayland_without_display_is_skipped() {
        let host = FixedHost::new(1000, 1000);
        assert!(args_for(Permission::Wayland, &host, false).is_empty());
    }

    #[test]
    fn audio_points_pulse_at_runtime_dir() {
        let args = args_for(Permission::Audio, &FixedHost::new(1000, 1000), false);
        assert!(args.contains(&"unix:/run/user/1000/pulse/native".to_string()));
        assert!(args.contains(&"/run/user/1000/pipewire-0".to_string()));
    }

    #[test]
    fn optical_scans_sequential_devices() {
        let host = FixedHost::new(1000, 1000)
            .with_path("/dev/sr0")
            .with_path("/dev/sg0")
            .with_path("/dev/sg1")
            .with_path("/dev/sr5");
        let args = args_for(Permission::Optical, &host, false);
        assert!(args.contains(&"/dev/sg1".to_string()));
        assert!(!args.contains(&"/dev/sr5".to_string()));
    }

    #[test]
    fn gpu_adds_nvidia_nodes() {
        let host = FixedHost::new(1000, 1000).with_path("/dev/nvidia0");
        let args = args_for(Permission::Gpu, &host, false);
        assert_eq!(
            args,
            vec![
                "--dev-bind-try",
                "/dev/dri",
                "/dev/dri",
                "--dev-bind-try",
                "/dev/nvidia0",
                "/dev/nvidia0"
            ]
        );
    }

    #[test]
    fn bus_address_parsing() {
        assert_eq!(
            session_bus_path("unix:path=/tmp/bus"),
            Some(PathBuf::from("/tmp/bus"))
        );
        assert_eq!(session_bus_path("tcp:host=x"), None);
    }
}
