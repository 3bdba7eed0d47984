use super::fs::FsPathBuf;
use crate::once_regex;
use crate::parsing::{parse_key_value_pair_lines, parse_uuid, StringPair};
#[mockall_double::double]
use crate::sys::process::double as process_double;
use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use process_double::run_command_as_result;
pub use operations::*;
use serde::{Deserialize, Deserializer};
use std::collections::HashMap;
use std::path::Path;
use std::process::Command;
use uuid::Uuid;

fn btrfs_command() -> Command {
    Command::new("btrfs")
}

/// A snapshot subvolume as reported by `btrfs subvolume show`/`list -s`.
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct Subvolume {
    #[serde(rename = "subvolume id")]
    pub id: u64,
    pub uuid: Uuid,
    pub path: FsPathBuf,
    #[serde(rename = "parent uuid")]
    pub parent_uuid: Option<Uuid>,
    #[serde(rename = "received uuid")]
    pub received_uuid: Option<Uuid>,
    #[serde(rename = "creation time", deserialize_with = "deserialize_btrfs_datetime")]
    pub otime: DateTime<Utc>,
}

/// A subvolume line from a plain `btrfs subvolume list`, used where creation
/// times are not needed (partial-receive cleanup).
#[derive(Debug, Clone, PartialEq)]
pub struct SubvolumeEntry {
    pub uuid: Uuid,
    pub path: FsPathBuf,
    pub parent_uuid: Option<Uuid>,
    pub received_uuid: Option<Uuid>,
}

impl Subvolume {
    pub fn from_path(path: &Path) -> Result<Self> {
        let output_data = run_command_as_result({
            let mut command = btrfs_command();
            command.args(&["subvolume", "show", "--raw"]).arg(path);
            command
        })?;
        Self::_parse(String::from("path: ") + &output_data)
    }

    /// Snapshots below `path`, with creation times. Paths in the result are
    /// relative to the filesystem tree root.
    pub fn list_snapshots(path: &Path) -> Result<Vec<Subvolume>> {
        let lines_regex = once_regex!(
            r"(?m)^ID\s+(\d+)\s.*\botime\s+([0-9-]+\s[0-9:]+)\s+parent_uuid\s+(\S+)\s+received_uuid\s+(\S+)\s+uuid\s+(\S+)\s+path\s+(.*?)\s*$"
        );
        let output_data = run_command_as_result({
            let mut command = btrfs_command();
            command.args(&["subvolume", "list", "-suqRo"]).arg(path);
            command
        })?;
        let parse_uuid = |m| parse_uuid(m).expect("Should always have parsable UUID in btrfs list.");
        Ok(lines_regex
            .captures_iter(&output_data)
            .map(|m| Self {
                id: m.get(1).unwrap().as_str().parse().expect("subvolume id is numeric"),
                otime: parse_btrfs_datetime(m.get(2).unwrap().as_str())
                    .expect("Should always have parsable otime in btrfs list."),
                parent_uuid: match m.get(3).unwrap().as_str() {
                    "-" => None,
                    s => Some(parse_uuid(s)),
                },
                received_uuid: match m.get(4).unwrap().as_str() {
                    "-" => None,
                    s => Some(parse_uuid(s)),
                },
                uuid: parse_uuid(m.get(5).unwrap().as_str()),
                path: FsPathBuf::from(m.get(6).unwrap().as_str()),
            })
            .collect::<Vec<_>>())
    }

    /// All subvolumes below `path`, snapshots or not. Receive targets that
    /// were never finalized show up here without a received uuid.
    pub fn list_all(path: &Path) -> Result<Vec<SubvolumeEntry>> {
        let lines_regex = once_regex!(
            r"(?m)\bparent_uuid\s+(.*?)\s+received_uuid\s+(.*?)\s+uuid\s+(.*?)\s+path\s+(.*?)\s*$"
        );
        let output_data = run_command_as_result({
            let mut command = btrfs_command();
            command.args(&["subvolume", "list", "-uqRo"]).arg(path);
            command
        })?;
        let parse_uuid = |m| parse_uuid(m).expect("Should always have parsable UUID in btrfs list.");
        Ok(lines_regex
            .captures_iter(&output_data)
            .map(|m| SubvolumeEntry {
                parent_uuid: match m.get(1).unwrap().as_str() {
                    "-" => None,
                    s => Some(parse_uuid(s)),
                },
                received_uuid: match m.get(2).unwrap().as_str() {
                    "-" => None,
                    s => Some(parse_uuid(s)),
                },
                uuid: parse_uuid(m.get(3).unwrap().as_str()),
                path: FsPathBuf::from(m.get(4).unwrap().as_str()),
            })
            .collect::<Vec<_>>())
    }

    fn _parse(data: String) -> Result<Self> {
        let kvps = parse_key_value_pair_lines::<_, Vec<StringPair>>(data.lines().take(7), ":")
            .context("Failed to parse output of btrfs subvolume.")?;

        let subvolume = envy::from_iter::<_, Self>(kvps.into_iter().filter_map(|x| {
            if x.1 != "-" {
                Some((x.0.to_uppercase(), x.1))
            } else {
                None
            }
        }))
        .context("Failed loading information from btrfs subvolume output.")?;
        Ok(subvolume)
    }
}

pub(crate) fn parse_btrfs_datetime(value: &str) -> Result<DateTime<Utc>> {
    if let Ok(datetime) = DateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S %z") {
        return Ok(datetime.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S")
        .map(|naive| DateTime::<Utc>::from_utc(naive, Utc))
        .context(format!("'{}' is not a btrfs timestamp", value))
}

fn deserialize_btrfs_datetime<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = String::deserialize(deserializer)?;
    parse_btrfs_datetime(&value).map_err(serde::de::Error::custom)
}

pub fn delete_subvolume(path: &Path) -> Result<()> {
    run_command_as_result({
        let mut command = btrfs_command();
        command.args(&["subvolume", "delete"]).arg(path);
        command
    })
    .context(format!("Failed to delete btrfs subvolume at {:?}.", path))
    .map(|_| ())
}

// ## Quota ##########################################################################################################

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QgroupUsage {
    pub referenced: u64,
    pub exclusive: u64,
}

pub fn quota_rescan(path: &Path) -> Result<()> {
    run_command_as_result({
        let mut command = btrfs_command();
        command.args(&["quota", "rescan", "-w"]).arg(path);
        command
    })
    .context(format!("Failed to rescan quota data below {:?}.", path))
    .map(|_| ())
}

/// Per-subvolume level 0 qgroup usage, keyed by subvolume id.
pub fn qgroup_usage(path: &Path) -> Result<HashMap<u64, QgroupUsage>> {
    let lines_regex = once_regex!(r"(?m)^0/(\d+)\s+(\d+)\s+(\d+)\s*$");
    let output_data = run_command_as_result({
        let mut command = btrfs_command();
        command.args(&["qgroup", "show", "--raw"]).arg(path);
        command
    })?;
    Ok(lines_regex
        .captures_iter(&output_data)
        .map(|m| {
            (
                m.get(1).unwrap().as_str().parse().expect("qgroup id is numeric"),
                QgroupUsage {
                    referenced: m.get(2).unwrap().as_str().parse().expect("rfer is numeric"),
                    exclusive: m.get(3).unwrap().as_str().parse().expect("excl is numeric"),
                },
            )
        })
        .collect())
}

mod operations {
    use crate::sys::process::exit_status_as_result;
    use anyhow::{anyhow, Context as AnyhowContext, Result};
    use std::path::Path;
    use std::process::Stdio;
    use tokio::{
        io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader},
        process::{Child, ChildStdin, ChildStdout, Command},
        task::JoinHandle,
    };

    pub fn send_snapshot(path: &Path, parent: Option<&Path>) -> SnapshotSender {
        let mut command = Command::new("btrfs");
        match parent {
            Some(parent_path) => command.arg("send").arg("-p").arg(parent_path).arg(path),
            None => command.arg("send").arg(path),
        };
        SnapshotSender::new(command)
    }

    pub fn measure_snapshot(path: &Path, parent: Option<&Path>) -> SnapshotMeasure {
        let mut command = Command::new("btrfs");
        command.arg("send").arg("--no-data");
        if let Some(parent_path) = parent {
            command.arg("-p").arg(parent_path);
        }
        command.arg(path);
        SnapshotMeasure::new(command)
    }

    pub fn receive_snapshot(into_path: &Path) -> SnapshotReceiver {
        let mut command = Command::new("btrfs");
        command.arg("receive").arg(into_path);
        SnapshotReceiver::new(command)
    }

    pub struct SnapshotSender {
        command: Command,
    }

    impl SnapshotSender {
        fn new(mut command: Command) -> Self {
            command.stdout(Stdio::piped());
            command.stderr(Stdio::null());
            command.kill_on_drop(true);
            Self { command }
        }

        pub fn start(mut self) -> Result<StartedSnapshotSender> {
            self.command
                .spawn()
                .map(|process| StartedSnapshotSender { process })
                .map_err(|e| anyhow!(e))
        }
    }

    pub struct StartedSnapshotSender {
        process: Child,
    }

    impl StartedSnapshotSender {
        pub fn reader(&mut self) -> ChildStdout {
            self.process
                .stdout
                .take()
                .expect("child did not have a handle to stdout")
        }

        pub async fn wait(mut self) -> Result<()> {
            exit_status_as_result(self.process.wait().await?)
        }
    }

    pub struct SnapshotMeasure {
        command: Command,
    }

    impl SnapshotMeasure {
        fn new(mut command: Command) -> Self {
            command.stdout(Stdio::piped());
            command.stderr(Stdio::null());
            command.kill_on_drop(true);
            Self { command }
        }

        /// Run the metadata-only send to completion, counting stream bytes.
        pub async fn measure(mut self) -> Result<u64> {
            let mut process = self.command.spawn().context("failed to spawn btrfs send --no-data")?;
            let mut reader = process.stdout.take().expect("child did not have a handle to stdout");
            let mut buffer = [0u8; 64 * 1024];
            let mut total = 0u64;
            loop {
                let count = reader.read(&mut buffer).await?;
                if count == 0 {
                    break;
                }
                total += count as u64;
            }
            exit_status_as_result(process.wait().await?)?;
            Ok(total)
        }
    }

    pub struct SnapshotReceiver {
        command: Command,
    }

    impl SnapshotReceiver {
        fn new(mut command: Command) -> Self {
            command.stdin(Stdio::piped());
            command.stdout(Stdio::piped());
            command.stderr(Stdio::piped());
            command.kill_on_drop(true);
            Self { command }
        }

        pub fn start(mut self) -> Result<StartedSnapshotReceiver> {
            self.command.spawn().map_err(|e| anyhow!(e)).map(|mut process| {
                let name_reader_stdout = Self::spawn_name_reader(process.stdout.take().expect("only taken once"));
                let name_reader_stderr = Self::spawn_name_reader(process.stderr.take().expect("only taken once"));
                StartedSnapshotReceiver {
                    process,
                    name_reader_stdout,
                    name_reader_stderr,
                }
            })
        }

        fn spawn_name_reader(handle: impl AsyncRead + Unpin + Send + 'static) -> JoinHandle<Result<Option<String>>> {
            tokio::spawn(async move {
                const PREFIX1: &str = "At subvol ";
                const PREFIX1_LEN: usize = PREFIX1.len();
                const PREFIX2: &str = "At snapshot ";
                const PREFIX2_LEN: usize = PREFIX2.len();
                let mut reader = BufReader::new(handle);
                let mut buffer = String::new();
                let mut result = None;
                while reader.read_line(&mut buffer).await? > 0 {
                    if result.is_none() {
                        if buffer.starts_with(PREFIX1) && buffer.len() > PREFIX1_LEN {
                            result = Some(buffer[PREFIX1_LEN..].trim().to_string());
                        } else if buffer.starts_with(PREFIX2) && buffer.len() > PREFIX2_LEN {
                            result = Some(buffer[PREFIX2_LEN..].trim().to_string());
                        }
                    }
                    buffer.clear();
                }
                Ok(result)
            })
        }
    }

    pub struct StartedSnapshotReceiver {
        process: Child,
        name_reader_stdout: JoinHandle<Result<Option<String>>>,
        name_reader_stderr: JoinHandle<Result<Option<String>>>,
    }

    impl StartedSnapshotReceiver {
        pub fn writer(&mut self) -> ChildStdin {
            self.process
                .stdin
                .take()
                .expect("child did not have a handle to stdin")
        }

        /// Wait for the receive to finish and report the incoming subvolume
        /// name announced on the process output.
        pub async fn wait(mut self) -> Result<String> {
            exit_status_as_result(self.process.wait().await?)?;
            let stdout_result = self.name_reader_stdout.await.expect("task doesn't panic")?;
            let stderr_result = self.name_reader_stderr.await.expect("task doesn't panic")?;
            let incoming_snapshot_name = stdout_result
                .or(stderr_result)
                .context("failed to find incoming subvol name")?;
            Ok(incoming_snapshot_name)
        }

        pub async fn abort(mut self) -> Result<()> {
            self.process.kill().await.context("failed to kill btrfs receive")?;
            let _ = self.name_reader_stdout.await;
            let _ = self.name_reader_stderr.await;
            Ok(())
        }
    }
}
