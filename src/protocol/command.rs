//! Command payloads executed by the guest.
//!
//! A payload is `<verb> <args…>` with single spaces between fields. Free text
//! and paths are base64 fields; a few legacy fields are bare tokens (ids,
//! sub-verbs, booleans) and `file filecopy` carries the file contents raw as
//! the trailing field.
//!
//! # Grammar
//!
//! | Verb | Fields |
//! |------|--------|
//! | `application` | `<module> <windowId> <method> [<b64 arg>…]` |
//! | `shellExec` | `<id> <b64 cmd> <b64 prefix> [<b64 stdin>]` |
//! | `killShellExec` | `<id>` |
//! | `remoteShellExec` | `<id> <b64 name> <b64 contents> <b64 targetDir> [<b64 stdin>]` |
//! | `file` | `<sub-verb> <fields…>` (see [`FileCommand`]) |
//! | `guesttime` / `guesttzone` / `initClean` | none |
//! | `setOSTime` | `<b64 time> True\|False` |
//! | `runElevated` | `<b64 cmd>` |
//! | `cleanUp` | `<b64 mode>` |

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::identifiers::{ShellExecId, WindowId};

use super::args::{CommandArgs, decode_field, decode_text, encode_field};

// ============================================================================
// Constants
// ============================================================================

/// Prefix field value meaning "no working directory prefix".
pub const UNSET_PREFIX: &str = "#unset";

// ============================================================================
// Verb
// ============================================================================

/// First token of every payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    /// Application window call or event.
    Application,
    /// Run a shell command on the guest.
    ShellExec,
    /// Result of a `shellExec`.
    ShellExecComplete,
    /// Interrupt a running `shellExec`.
    KillShellExec,
    /// Ship an executable and run it.
    RemoteShellExec,
    /// File system operation.
    File,
    /// Guest date and time report.
    Time,
    /// Guest timezone report.
    Tzone,
    /// Guest information report.
    Info,
    /// Ask the guest for its date and time.
    GuestTime,
    /// Ask the guest for its timezone.
    GuestTzone,
    /// Set the guest clock.
    SetOsTime,
    /// Run a command with elevated rights.
    RunElevated,
    /// Remove traces of the agent.
    CleanUp,
    /// Prepare the guest for a clean run.
    InitClean,
    /// Guest handshake announcing its network identity.
    Register,
}

impl Verb {
    /// Returns the wire spelling.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Application => "application",
            Self::ShellExec => "shellExec",
            Self::ShellExecComplete => "shellExecComplete",
            Self::KillShellExec => "killShellExec",
            Self::RemoteShellExec => "remoteShellExec",
            Self::File => "file",
            Self::Time => "time",
            Self::Tzone => "tzone",
            Self::Info => "info",
            Self::GuestTime => "guesttime",
            Self::GuestTzone => "guesttzone",
            Self::SetOsTime => "setOSTime",
            Self::RunElevated => "runElevated",
            Self::CleanUp => "cleanUp",
            Self::InitClean => "initClean",
            Self::Register => "register",
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Verb {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let verb = match s {
            "application" => Self::Application,
            "shellExec" => Self::ShellExec,
            "shellExecComplete" => Self::ShellExecComplete,
            "killShellExec" => Self::KillShellExec,
            "remoteShellExec" => Self::RemoteShellExec,
            "file" => Self::File,
            "time" => Self::Time,
            "tzone" => Self::Tzone,
            "info" => Self::Info,
            "guesttime" => Self::GuestTime,
            "guesttzone" => Self::GuestTzone,
            "setOSTime" => Self::SetOsTime,
            "runElevated" => Self::RunElevated,
            "cleanUp" => Self::CleanUp,
            "initClean" => Self::InitClean,
            "register" => Self::Register,
            other => return Err(Error::unknown_verb(other)),
        };
        Ok(verb)
    }
}

// ============================================================================
// Tokens
// ============================================================================

/// Cursor over the space separated fields of one payload.
pub(crate) struct Tokens<'a> {
    verb: Verb,
    rest: Option<&'a [u8]>,
}

impl<'a> Tokens<'a> {
    /// Splits off and parses the verb.
    pub(crate) fn new(payload: &'a [u8]) -> Result<Self> {
        let (head, rest) = match payload.iter().position(|&b| b == b' ') {
            Some(pos) => (&payload[..pos], Some(&payload[pos + 1..])),
            None => (payload, None),
        };
        let head = std::str::from_utf8(head)
            .map_err(|_| Error::unknown_verb(String::from_utf8_lossy(head)))?;
        let verb = head.parse()?;
        Ok(Self { verb, rest })
    }

    #[inline]
    pub(crate) fn verb(&self) -> Verb {
        self.verb
    }

    /// Next field, or `None` once the payload is exhausted.
    pub(crate) fn next_field(&mut self) -> Option<&'a [u8]> {
        let rest = self.rest?;
        match rest.iter().position(|&b| b == b' ') {
            Some(pos) => {
                self.rest = Some(&rest[pos + 1..]);
                Some(&rest[..pos])
            }
            None => {
                self.rest = None;
                Some(rest)
            }
        }
    }

    /// Next field that is present and non-empty.
    pub(crate) fn next_non_empty(&mut self) -> Option<&'a [u8]> {
        self.next_field().filter(|field| !field.is_empty())
    }

    /// Everything after the current position, spaces included.
    pub(crate) fn remainder(&mut self) -> &'a [u8] {
        self.rest.take().unwrap_or_default()
    }

    /// Remaining fields, split on spaces.
    pub(crate) fn rest_fields(&mut self) -> Vec<&'a [u8]> {
        std::iter::from_fn(|| self.next_field()).collect()
    }

    /// Required bare token.
    pub(crate) fn token(&mut self, name: &str) -> Result<&'a str> {
        let field = self.required(name)?;
        std::str::from_utf8(field)
            .map_err(|_| Error::malformed(self.verb.as_str(), format!("{name} is not UTF-8")))
    }

    /// Required bare token parsed with [`FromStr`].
    pub(crate) fn parse<T: FromStr>(&mut self, name: &str) -> Result<T> {
        let token = self.token(name)?;
        token
            .parse()
            .map_err(|_| Error::malformed(self.verb.as_str(), format!("invalid {name}: {token:?}")))
    }

    /// Required base64 field decoded to text.
    pub(crate) fn text(&mut self, name: &str) -> Result<String> {
        decode_text(self.required(name)?)
    }

    /// Required base64 field decoded to bytes.
    pub(crate) fn bytes(&mut self, name: &str) -> Result<Vec<u8>> {
        decode_field(self.required(name)?)
    }

    /// Optional trailing base64 field.
    pub(crate) fn opt_bytes(&mut self) -> Result<Option<Vec<u8>>> {
        self.next_non_empty().map(decode_field).transpose()
    }

    fn required(&mut self, name: &str) -> Result<&'a [u8]> {
        self.next_field()
            .ok_or_else(|| Error::malformed(self.verb.as_str(), format!("missing {name}")))
    }
}

// ============================================================================
// CommandBuilder
// ============================================================================

/// Builds an outbound payload field by field.
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    payload: Vec<u8>,
}

impl CommandBuilder {
    /// Starts a payload with its verb.
    #[must_use]
    pub fn new(verb: Verb) -> Self {
        Self {
            payload: verb.as_str().as_bytes().to_vec(),
        }
    }

    /// Appends a bare token.
    #[must_use]
    pub fn token(mut self, token: impl fmt::Display) -> Self {
        self.payload.push(b' ');
        self.payload.extend_from_slice(token.to_string().as_bytes());
        self
    }

    /// Appends a base64 field.
    #[must_use]
    pub fn field(mut self, bytes: impl AsRef<[u8]>) -> Self {
        self.payload.push(b' ');
        self.payload.extend_from_slice(encode_field(bytes).as_bytes());
        self
    }

    /// Appends a base64 field when a value is present.
    #[must_use]
    pub fn opt_field(self, bytes: Option<impl AsRef<[u8]>>) -> Self {
        match bytes {
            Some(bytes) => self.field(bytes),
            None => self,
        }
    }

    /// Appends raw bytes as the trailing field.
    #[must_use]
    pub fn raw(mut self, bytes: &[u8]) -> Self {
        self.payload.push(b' ');
        self.payload.extend_from_slice(bytes);
        self
    }

    /// Finishes the payload.
    #[inline]
    #[must_use]
    pub fn build(self) -> Vec<u8> {
        self.payload
    }
}

// ============================================================================
// ApplicationCall
// ============================================================================

/// Method call on an application window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplicationCall {
    /// Registered module name.
    pub module: String,
    /// Target window.
    pub window_id: WindowId,
    /// Method name from the module's method table.
    pub method: String,
    /// Decoded positional arguments.
    pub args: CommandArgs,
}

// ============================================================================
// ShellExecCommand
// ============================================================================

/// Shell command to run on the guest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellExecCommand {
    /// Correlation id.
    pub id: ShellExecId,
    /// Command line.
    pub command: String,
    /// Text prepended to the command line, such as the executable's directory.
    pub path_prefix: Option<String>,
    /// Data written to the command's standard input.
    pub stdin: Option<Vec<u8>>,
}

/// Executable shipped from the host and run as a ShellExec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteShellExecCommand {
    /// Correlation id.
    pub id: ShellExecId,
    /// File name of the executable.
    pub file_name: String,
    /// Executable contents.
    pub contents: Vec<u8>,
    /// Guest directory the executable is written to; [`UNSET_PREFIX`] means
    /// the agent's working directory.
    pub target_dir: String,
    /// Data written to the process's standard input.
    pub stdin: Option<Vec<u8>>,
}

// ============================================================================
// FileCommand
// ============================================================================

/// `file` sub-commands.
///
/// | Sub-verb | Fields |
/// |----------|--------|
/// | `filecopy` | `<b64 target> <raw contents>` |
/// | `dircopy` | `<b64 targetDir> <b64 zip archive>` |
/// | `dircreate` / `touch` / `guestdelete` / `guestchdir` | `<b64 path>` |
/// | `guestcopy` / `guestmove` | `<b64 source> <b64 target>` |
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileCommand {
    /// Write `contents` to the guest path `target`.
    Copy {
        /// Destination file path.
        target: String,
        /// File contents.
        contents: Vec<u8>,
    },
    /// Unpack a zip archive under `target_dir`.
    CopyDirectory {
        /// Destination directory, created if absent.
        target_dir: String,
        /// Zip archive bytes.
        archive: Vec<u8>,
    },
    /// Create a directory and its parents.
    CreateDirectory {
        /// Directory path.
        path: String,
    },
    /// Create a file or update its modification time.
    Touch {
        /// File path.
        path: String,
    },
    /// Copy a file within the guest.
    GuestCopy {
        /// Source path.
        source: String,
        /// Destination path.
        target: String,
    },
    /// Move a file within the guest.
    GuestMove {
        /// Source path.
        source: String,
        /// Destination path.
        target: String,
    },
    /// Delete a file or directory tree.
    GuestDelete {
        /// Path to delete.
        path: String,
    },
    /// Change the agent's working directory.
    ChangeDirectory {
        /// New working directory.
        path: String,
    },
}

impl FileCommand {
    /// Returns the sub-verb token.
    #[must_use]
    pub const fn sub_verb(&self) -> &'static str {
        match self {
            Self::Copy { .. } => "filecopy",
            Self::CopyDirectory { .. } => "dircopy",
            Self::CreateDirectory { .. } => "dircreate",
            Self::Touch { .. } => "touch",
            Self::GuestCopy { .. } => "guestcopy",
            Self::GuestMove { .. } => "guestmove",
            Self::GuestDelete { .. } => "guestdelete",
            Self::ChangeDirectory { .. } => "guestchdir",
        }
    }

    fn parse(tokens: &mut Tokens<'_>) -> Result<Self> {
        let sub_verb = tokens.token("sub-verb")?;
        let command = match sub_verb {
            "filecopy" => Self::Copy {
                target: tokens.text("target")?,
                contents: tokens.remainder().to_vec(),
            },
            "dircopy" => Self::CopyDirectory {
                target_dir: tokens.text("target directory")?,
                archive: tokens.bytes("archive")?,
            },
            "dircreate" => Self::CreateDirectory {
                path: tokens.text("path")?,
            },
            "touch" => Self::Touch {
                path: tokens.text("path")?,
            },
            "guestcopy" => Self::GuestCopy {
                source: tokens.text("source")?,
                target: tokens.text("target")?,
            },
            "guestmove" => Self::GuestMove {
                source: tokens.text("source")?,
                target: tokens.text("target")?,
            },
            "guestdelete" => Self::GuestDelete {
                path: tokens.text("path")?,
            },
            "guestchdir" => Self::ChangeDirectory {
                path: tokens.text("path")?,
            },
            other => {
                return Err(Error::malformed(
                    Verb::File.as_str(),
                    format!("unknown sub-verb {other:?}"),
                ));
            }
        };
        Ok(command)
    }

    fn write(&self, builder: CommandBuilder) -> CommandBuilder {
        let builder = builder.token(self.sub_verb());
        match self {
            Self::Copy { target, contents } => builder.field(target).raw(contents),
            Self::CopyDirectory {
                target_dir,
                archive,
            } => builder.field(target_dir).field(archive),
            Self::CreateDirectory { path }
            | Self::Touch { path }
            | Self::GuestDelete { path }
            | Self::ChangeDirectory { path } => builder.field(path),
            Self::GuestCopy { source, target } | Self::GuestMove { source, target } => {
                builder.field(source).field(target)
            }
        }
    }
}

// ============================================================================
// GuestCommand
// ============================================================================

/// Every payload the guest agent accepts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuestCommand {
    /// Application window method call.
    Application(ApplicationCall),
    /// Run a shell command.
    ShellExec(ShellExecCommand),
    /// Interrupt a running shell command.
    KillShellExec {
        /// Id of the running command.
        id: ShellExecId,
    },
    /// Ship and run an executable.
    RemoteShellExec(RemoteShellExecCommand),
    /// File system operation.
    File(FileCommand),
    /// Report date and time.
    GuestTime,
    /// Report timezone.
    GuestTimezone,
    /// Set the OS clock.
    SetOsTime {
        /// New time, in the format the guest's clock tool accepts.
        time: String,
        /// Interpret `time` as local time instead of UTC.
        local: bool,
    },
    /// Run a command with elevated rights.
    RunElevated {
        /// Command line.
        command: String,
    },
    /// Remove traces of the agent.
    CleanUp {
        /// Cleanup mode understood by the guest.
        mode: String,
    },
    /// Prepare the guest for a clean run.
    InitClean,
}

impl GuestCommand {
    /// Parses a payload received by the guest.
    ///
    /// # Errors
    ///
    /// - [`Error::UnknownVerb`] if the verb is not part of the protocol
    /// - [`Error::MalformedCommand`] if fields are missing or invalid
    /// - [`Error::Base64`] if a base64 field does not decode
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let mut tokens = Tokens::new(payload)?;

        let command = match tokens.verb() {
            Verb::Application => {
                let module = tokens.token("module")?.to_string();
                let window_id = tokens.parse("window id")?;
                let method = tokens.token("method")?.to_string();
                // An empty field is an empty argument; no field separator
                // is ever dropped.
                let fields = tokens.rest_fields();
                Self::Application(ApplicationCall {
                    module,
                    window_id,
                    method,
                    args: CommandArgs::decode(fields)?,
                })
            }

            Verb::ShellExec => {
                let id = tokens.parse("id")?;
                let command = tokens.text("command")?;
                let path_prefix = match tokens.next_non_empty() {
                    Some(field) => Some(decode_text(field)?),
                    None => None,
                }
                .filter(|prefix| prefix != UNSET_PREFIX);
                Self::ShellExec(ShellExecCommand {
                    id,
                    command,
                    path_prefix,
                    stdin: tokens.opt_bytes()?,
                })
            }

            Verb::KillShellExec => Self::KillShellExec {
                id: tokens.parse("id")?,
            },

            Verb::RemoteShellExec => Self::RemoteShellExec(RemoteShellExecCommand {
                id: tokens.parse("id")?,
                file_name: tokens.text("file name")?,
                contents: tokens.bytes("contents")?,
                target_dir: tokens.text("target directory")?,
                stdin: tokens.opt_bytes()?,
            }),

            Verb::File => Self::File(FileCommand::parse(&mut tokens)?),

            Verb::GuestTime => Self::GuestTime,
            Verb::GuestTzone => Self::GuestTimezone,
            Verb::InitClean => Self::InitClean,

            Verb::SetOsTime => {
                let time = tokens.text("time")?;
                let local = tokens
                    .next_non_empty()
                    .is_none_or(|flag| flag.eq_ignore_ascii_case(b"true"));
                Self::SetOsTime { time, local }
            }

            Verb::RunElevated => Self::RunElevated {
                command: tokens.text("command")?,
            },

            Verb::CleanUp => Self::CleanUp {
                mode: tokens.text("mode")?,
            },

            verb @ (Verb::ShellExecComplete
            | Verb::Time
            | Verb::Tzone
            | Verb::Info
            | Verb::Register) => {
                return Err(Error::malformed(verb.as_str(), "not accepted by the guest"));
            }
        };

        Ok(command)
    }

    /// Renders the command as a wire payload.
    #[must_use]
    pub fn to_payload(&self) -> Vec<u8> {
        match self {
            Self::Application(call) => {
                let builder = CommandBuilder::new(Verb::Application)
                    .token(&call.module)
                    .token(call.window_id)
                    .token(&call.method);
                call.args
                    .iter()
                    .fold(builder, |builder, arg| builder.field(arg))
                    .build()
            }
            Self::ShellExec(exec) => CommandBuilder::new(Verb::ShellExec)
                .token(exec.id)
                .field(&exec.command)
                .field(exec.path_prefix.as_deref().unwrap_or(UNSET_PREFIX))
                .opt_field(exec.stdin.as_ref())
                .build(),
            Self::KillShellExec { id } => CommandBuilder::new(Verb::KillShellExec).token(id).build(),
            Self::RemoteShellExec(exec) => CommandBuilder::new(Verb::RemoteShellExec)
                .token(exec.id)
                .field(&exec.file_name)
                .field(&exec.contents)
                .field(&exec.target_dir)
                .opt_field(exec.stdin.as_ref())
                .build(),
            Self::File(file) => file.write(CommandBuilder::new(Verb::File)).build(),
            Self::GuestTime => CommandBuilder::new(Verb::GuestTime).build(),
            Self::GuestTimezone => CommandBuilder::new(Verb::GuestTzone).build(),
            Self::InitClean => CommandBuilder::new(Verb::InitClean).build(),
            Self::SetOsTime { time, local } => CommandBuilder::new(Verb::SetOsTime)
                .field(time)
                .token(if *local { "True" } else { "False" })
                .build(),
            Self::RunElevated { command } => CommandBuilder::new(Verb::RunElevated)
                .field(command)
                .build(),
            Self::CleanUp { mode } => CommandBuilder::new(Verb::CleanUp).field(mode).build(),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verb_exact_match() {
        assert_eq!("time".parse::<Verb>().expect("verb"), Verb::Time);
        assert_eq!("guesttime".parse::<Verb>().expect("verb"), Verb::GuestTime);
        assert!("Time".parse::<Verb>().is_err());
        assert!("times".parse::<Verb>().is_err());
    }

    #[test]
    fn test_unknown_verb() {
        let err = GuestCommand::parse(b"frobnicate 1 2").expect_err("unknown");
        assert!(matches!(err, Error::UnknownVerb { verb } if verb == "frobnicate"));
    }

    #[test]
    fn test_parse_application_call() {
        let payload = format!(
            "application fileManagement 7 recycle {} {}",
            encode_field("C:\\Users\\alice\\Desktop\\notes.txt"),
            encode_field("--force"),
        );
        let GuestCommand::Application(call) =
            GuestCommand::parse(payload.as_bytes()).expect("parse")
        else {
            panic!("expected application call");
        };
        assert_eq!(call.module, "fileManagement");
        assert_eq!(call.window_id, WindowId::new(7));
        assert_eq!(call.method, "recycle");
        assert_eq!(call.args.str_at(0).expect("arg"), "C:\\Users\\alice\\Desktop\\notes.txt");
        assert_eq!(call.args.str_at(1).expect("arg"), "--force");
    }

    #[test]
    fn test_parse_application_without_args() {
        let command = GuestCommand::parse(b"application webBrowser 2 close").expect("parse");
        let GuestCommand::Application(call) = command else {
            panic!("expected application call");
        };
        assert!(call.args.is_empty());
    }

    #[test]
    fn test_application_empty_args_survive() {
        for args in [vec!["hello", ""], vec![""], vec!["", "", "tail"]] {
            let call = GuestCommand::Application(ApplicationCall {
                module: "notepad".into(),
                window_id: WindowId::new(1),
                method: "write".into(),
                args: CommandArgs::new(args.iter().copied()),
            });
            let GuestCommand::Application(parsed) =
                GuestCommand::parse(&call.to_payload()).expect("parse")
            else {
                panic!("expected application call");
            };
            assert_eq!(parsed.args.len(), args.len(), "args {args:?}");
            for (index, expected) in args.iter().enumerate() {
                assert_eq!(parsed.args.str_at(index).expect("arg"), *expected);
            }
        }
    }

    #[test]
    fn test_application_args_with_nul_and_unicode_survive() {
        let path = "/srv/ablage/Übersicht 2024\0.pdf";
        let call = GuestCommand::Application(ApplicationCall {
            module: "fileManagement".into(),
            window_id: WindowId::new(1),
            method: "open".into(),
            args: CommandArgs::new([path]),
        });
        let parsed = GuestCommand::parse(&call.to_payload()).expect("parse");
        let GuestCommand::Application(parsed) = parsed else {
            panic!("expected application call");
        };
        assert_eq!(parsed.args.str_at(0).expect("arg"), path);
    }

    #[test]
    fn test_shell_exec_unset_prefix() {
        let payload = GuestCommand::ShellExec(ShellExecCommand {
            id: ShellExecId::new(3),
            command: "ipconfig /all".into(),
            path_prefix: None,
            stdin: None,
        })
        .to_payload();

        let expected = format!(
            "shellExec 3 {} {}",
            encode_field("ipconfig /all"),
            encode_field(UNSET_PREFIX)
        );
        assert_eq!(payload, expected.as_bytes());

        let GuestCommand::ShellExec(exec) = GuestCommand::parse(&payload).expect("parse") else {
            panic!("expected shellExec");
        };
        assert_eq!(exec.path_prefix, None);
        assert_eq!(exec.stdin, None);
    }

    #[test]
    fn test_shell_exec_with_prefix_and_stdin() {
        let exec = ShellExecCommand {
            id: ShellExecId::new(9),
            command: "sort".into(),
            path_prefix: Some("cd /tmp &&".into()),
            stdin: Some(b"b\na\n".to_vec()),
        };
        let parsed = GuestCommand::parse(&GuestCommand::ShellExec(exec.clone()).to_payload())
            .expect("parse");
        assert_eq!(parsed, GuestCommand::ShellExec(exec));
    }

    #[test]
    fn test_filecopy_keeps_raw_trailing_bytes() {
        let contents = b"line one\nline two with spaces \x00\xff".to_vec();
        let command = GuestCommand::File(FileCommand::Copy {
            target: "C:\\temp\\a b.bin".into(),
            contents: contents.clone(),
        });
        let payload = command.to_payload();
        assert!(payload.ends_with(&contents));

        let GuestCommand::File(FileCommand::Copy {
            target,
            contents: parsed,
        }) = GuestCommand::parse(&payload).expect("parse")
        else {
            panic!("expected filecopy");
        };
        assert_eq!(target, "C:\\temp\\a b.bin");
        assert_eq!(parsed, contents);
    }

    #[test]
    fn test_filecopy_empty_file() {
        let command = GuestCommand::File(FileCommand::Copy {
            target: "/tmp/empty".into(),
            contents: Vec::new(),
        });
        assert_eq!(GuestCommand::parse(&command.to_payload()).expect("parse"), command);
    }

    #[test]
    fn test_unknown_file_sub_verb() {
        let payload = format!("file smbcopy {}", encode_field("x"));
        let err = GuestCommand::parse(payload.as_bytes()).expect_err("sub-verb");
        assert!(matches!(err, Error::MalformedCommand { .. }));
    }

    #[test]
    fn test_set_os_time_flag() {
        let payload = format!("setOSTime {} False", encode_field("2019-05-10 13:00:00"));
        let command = GuestCommand::parse(payload.as_bytes()).expect("parse");
        assert_eq!(
            command,
            GuestCommand::SetOsTime {
                time: "2019-05-10 13:00:00".into(),
                local: false,
            }
        );
    }

    #[test]
    fn test_missing_field_is_malformed() {
        let err = GuestCommand::parse(b"killShellExec").expect_err("missing id");
        assert!(matches!(err, Error::MalformedCommand { .. }));
    }

    #[test]
    fn test_host_verbs_rejected_by_guest() {
        let err = GuestCommand::parse(b"tzone VVRD").expect_err("direction");
        assert!(matches!(err, Error::MalformedCommand { .. }));
    }

    #[test]
    fn test_bare_verbs() {
        assert_eq!(GuestCommand::parse(b"guesttime ").expect("parse"), GuestCommand::GuestTime);
        assert_eq!(GuestCommand::parse(b"initClean").expect("parse"), GuestCommand::InitClean);
    }
}
