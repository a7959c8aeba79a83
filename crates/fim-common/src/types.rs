//! Closed token types parsed once at the command-line boundary.
//!
//! Permission names, unshare options, bind types, overlay backends and
//! distributions arrive as strings and are mapped here into tagged variants.
//! Invalid tokens produce a single [`FimError::Usage`] naming the token.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{FimError, Result};

/// A closed set of named tokens with a stable lowercase spelling.
pub trait Token: Copy + Ord + fmt::Display + 'static {
    /// Human-readable kind used in error messages.
    const KIND: &'static str;
    /// Every variant, in declaration order.
    const VARIANTS: &'static [Self];

    /// Lowercase spelling of the variant.
    fn name(self) -> &'static str;

    /// Parses one token, rejecting anything outside [`Token::VARIANTS`].
    ///
    /// # Errors
    ///
    /// Returns [`FimError::Usage`] naming the offending token.
    fn parse(s: &str) -> Result<Self> {
        let needle = s.trim().to_ascii_lowercase();
        Self::VARIANTS
            .iter()
            .copied()
            .find(|v| v.name() == needle)
            .ok_or_else(|| FimError::usage(format!("Invalid {} '{s}'", Self::KIND)))
    }
}

macro_rules! token_enum {
    (
        $(#[$meta:meta])*
        $name:ident, $kind:literal {
            $( $(#[$vmeta:meta])* $variant:ident => $text:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $( $(#[$vmeta])* $variant ),+
        }

        impl Token for $name {
            const KIND: &'static str = $kind;
            const VARIANTS: &'static [Self] = &[$(Self::$variant),+];

            fn name(self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.name())
            }
        }

        impl FromStr for $name {
            type Err = FimError;

            fn from_str(s: &str) -> Result<Self> {
                <Self as Token>::parse(s)
            }
        }
    };
}

token_enum! {
    /// Named grant of host resource access inside the sandbox.
    Permission, "permission" {
        /// Bind the host home directory.
        Home => "home",
        /// Share host network configuration.
        Network => "network",
        /// Pulse, pipewire and ALSA devices.
        Audio => "audio",
        /// DRI and NVIDIA devices.
        Gpu => "gpu",
        /// Input devices.
        Input => "input",
        /// USB buses.
        Usb => "usb",
        /// Removable media mount points.
        Media => "media",
        /// Session D-Bus socket.
        DbusUser => "dbus_user",
        /// System D-Bus socket.
        DbusSystem => "dbus_system",
        /// Wayland compositor socket.
        Wayland => "wayland",
        /// X11 display and authority.
        Xorg => "xorg",
        /// The whole host `/dev`.
        Dev => "dev",
        /// Optical drives.
        Optical => "optical",
        /// Shared memory.
        Shm => "shm",
        /// udev runtime database.
        Udev => "udev",
    }
}

token_enum! {
    /// Namespace that bubblewrap should unshare from the host.
    UnshareOption, "unshare option" {
        /// User namespace.
        User => "user",
        /// System V IPC namespace.
        Ipc => "ipc",
        /// PID namespace.
        Pid => "pid",
        /// Network namespace.
        Net => "net",
        /// Hostname namespace.
        Uts => "uts",
        /// Cgroup namespace.
        Cgroup => "cgroup",
    }
}

token_enum! {
    /// Kind of a user-declared bind mount.
    BindType, "bind type" {
        /// Read-only bind.
        Ro => "ro",
        /// Read-write bind.
        Rw => "rw",
        /// Device bind.
        Dev => "dev",
    }
}

token_enum! {
    /// Strategy used to merge the layer stack with the upper directory.
    OverlayKind, "overlay type" {
        /// bubblewrap's native `--overlay` primitive.
        Bwrap => "bwrap",
        /// The `fuse-overlayfs` daemon.
        Overlayfs => "overlayfs",
        /// The `unionfs-fuse` daemon.
        Unionfs => "unionfs",
    }
}

token_enum! {
    /// Distribution shipped inside the image.
    Distribution, "distribution" {
        /// Alpine Linux.
        Alpine => "alpine",
        /// Arch Linux.
        Arch => "arch",
        /// Bare root filesystem without a package manager.
        Blueprint => "blueprint",
    }
}

/// A user-declared bind mount from the host into the sandbox.
///
/// Paths may reference environment variables as `$VAR`, expanded when the
/// sandbox is built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Binding {
    /// Mount kind.
    #[serde(rename = "type")]
    pub kind: BindType,
    /// Host path.
    pub src: String,
    /// Path inside the sandbox.
    pub dst: String,
}

impl Default for OverlayKind {
    fn default() -> Self {
        Self::Bwrap
    }
}

/// Result of parsing a token list that may contain the `all` shorthand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection<T: Token> {
    /// Every variant of `T`.
    All,
    /// Exactly these variants.
    Only(BTreeSet<T>),
}

impl<T: Token> Selection<T> {
    /// Parses a list of arguments, each of which may itself be a
    /// comma-separated list.
    ///
    /// Validation is all-or-nothing: the first bad token aborts parsing.
    ///
    /// # Errors
    ///
    /// Returns [`FimError::Usage`] when the list is empty, a token is
    /// unknown, or `all` is combined with any other token.
    pub fn parse<S: AsRef<str>>(args: &[S]) -> Result<Self> {
        let tokens: Vec<&str> = args
            .iter()
            .flat_map(|a| a.as_ref().split(','))
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .collect();
        if tokens.is_empty() {
            return Err(FimError::usage(format!("Missing {} arguments", T::KIND)));
        }
        if tokens.iter().any(|t| t.eq_ignore_ascii_case("all")) {
            if tokens.len() > 1 {
                return Err(FimError::usage(format!(
                    "'all' {} cannot be combined with other tokens",
                    T::KIND
                )));
            }
            return Ok(Self::All);
        }
        tokens
            .into_iter()
            .map(T::parse)
            .collect::<Result<BTreeSet<T>>>()
            .map(Self::Only)
    }

    /// Expands the selection into a concrete set.
    pub fn into_set(self) -> BTreeSet<T> {
        match self {
            Self::All => T::VARIANTS.iter().copied().collect(),
            Self::Only(set) => set,
        }
    }
}
