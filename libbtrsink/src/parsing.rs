use crate::once_regex;
use anyhow::{anyhow, bail, Context as _, Result};
use std::{error::Error, fmt::Display, iter::FromIterator, str::FromStr};
use strum_macros::{Display as StrumDisplay, EnumString};
use uuid::Uuid;

pub type StringPair = (String, String);

pub fn parse_key_value_data<T: FromIterator<StringPair>>(data: &str) -> Result<T> {
    parse_key_value_pair_lines(data.lines(), "=")
}

pub fn parse_key_value_pair_lines<'a, T, U>(lines: T, seperator: &str) -> Result<U>
where
    T: Iterator<Item = &'a str>,
    U: FromIterator<StringPair>,
{
    lines
        .map(|s| parse_key_value_pair_line(s, seperator))
        .collect::<Result<U>>()
}

fn parse_key_value_pair_line(line: &str, seperator: &str) -> Result<StringPair> {
    let parts: Vec<&str> = line.splitn(2, seperator).collect();
    match parts.len() {
        2 => Ok((parts[0].trim().to_string(), parts[1].trim().to_string())),
        _ => Err(anyhow!("Invalid line in key value pair data.")),
    }
}

pub fn encode_key_value_data<'a, T>(pairs: T) -> String
where
    T: IntoIterator<Item = &'a StringPair>,
{
    pairs
        .into_iter()
        .map(|(k, v)| format!("{}={}\n", k, v))
        .collect::<String>()
}

pub fn parse_uuid<S: AsRef<str>>(value: S) -> Result<Uuid> {
    Uuid::parse_str(value.as_ref())
        .map_err(|e| e.source().map(|e| anyhow!(e.to_string())).unwrap_or(anyhow!(e)))
        .context(format!("'{}' is not a valid GUID", value.as_ref()))
}

// ## Store URIs #####################################################################################################

#[derive(Debug, Clone, Copy, PartialEq, Eq, StrumDisplay, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum StoreMethod {
    Btrfs,
    S3,
    Ssh,
}

/// A parsed `[method://]host/path[/snapshot]` store locator. The trailing
/// slash is significant: without it the path names a single snapshot rather
/// than a directory of snapshots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreUri {
    pub method: StoreMethod,
    pub host: Option<String>,
    pub path: String,
}

impl StoreUri {
    pub fn is_directory(&self) -> bool {
        self.path.ends_with('/')
    }

    /// Destination locators denote directories of snapshots. Callers that
    /// intend a single-snapshot destination suppress this with an explicit
    /// flag instead of relying on the locator shape.
    pub fn normalize_dest(&mut self) {
        if !self.path.ends_with('/') {
            self.path.push('/');
        }
    }

    /// The directory part and, for non-directory locators, the snapshot name.
    pub fn split_snapshot(&self) -> (String, Option<String>) {
        if self.is_directory() {
            return (self.path.clone(), None);
        }
        match self.path.rfind('/') {
            Some(idx) => (self.path[..=idx].to_string(), Some(self.path[idx + 1..].to_string())),
            None => (String::new(), Some(self.path.clone())),
        }
    }
}

impl FromStr for StoreUri {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let uri_regex = once_regex!(r"^(?:(?P<method>[^:/]+)://)?(?P<fullpath>(?P<host>[^/]*)(?:/(?P<path>.*))?)$");
        let captures = uri_regex
            .captures(s)
            .ok_or_else(|| anyhow!("can't parse snapshot store '{}'", s))?;

        let method = match captures.name("method") {
            Some(m) => m
                .as_str()
                .parse::<StoreMethod>()
                .map_err(|_| anyhow!("unknown store method '{}'", m.as_str()))?,
            None => StoreMethod::Btrfs,
        };

        match method {
            StoreMethod::Btrfs => {
                let path = captures
                    .name("fullpath")
                    .expect("fullpath group always matches")
                    .as_str();
                if path.is_empty() {
                    bail!("empty path in snapshot store '{}'", s);
                }
                Ok(Self {
                    method,
                    host: None,
                    path: path.to_string(),
                })
            }
            StoreMethod::S3 | StoreMethod::Ssh => {
                let host = captures
                    .name("host")
                    .map(|h| h.as_str())
                    .filter(|h| !h.is_empty())
                    .ok_or_else(|| anyhow!("store '{}' requires a host", s))?;
                Ok(Self {
                    method,
                    host: Some(host.to_string()),
                    path: captures.name("path").map(|p| p.as_str()).unwrap_or("").to_string(),
                })
            }
        }
    }
}

impl Display for StoreUri {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.host {
            Some(host) => write!(f, "{}://{}/{}", self.method, host, self.path),
            None => write!(f, "{}", self.path),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_value_data_round_trips() {
        let pairs = vec![
            (String::from("to_uuid"), String::from("8a7ae0b5-b28c-b240-8c07-0015431d58d8")),
            (String::from("size"), String::from("1269760")),
        ];
        let encoded = encode_key_value_data(&pairs);
        let decoded: Vec<StringPair> = parse_key_value_data(&encoded).unwrap();
        assert_eq!(decoded, pairs);
    }

    #[test]
    fn key_value_data_rejects_bare_lines() {
        assert!(parse_key_value_data::<Vec<StringPair>>("no separator here").is_err());
    }

    #[test]
    fn bare_path_is_btrfs() {
        let uri: StoreUri = "/mnt/snapshots/".parse().unwrap();
        assert_eq!(uri.method, StoreMethod::Btrfs);
        assert_eq!(uri.host, None);
        assert_eq!(uri.path, "/mnt/snapshots/");
        assert!(uri.is_directory());
    }

    #[test]
    fn explicit_btrfs_method() {
        let uri: StoreUri = "btrfs:///mnt/snapshots/daily".parse().unwrap();
        assert_eq!(uri.method, StoreMethod::Btrfs);
        assert!(!uri.is_directory());
        let (dir, snapshot) = uri.split_snapshot();
        assert_eq!(dir, "/mnt/snapshots/");
        assert_eq!(snapshot.as_deref(), Some("daily"));
    }

    #[test]
    fn ssh_store_has_host() {
        let uri: StoreUri = "ssh://backup.example.com/pool/snaps/".parse().unwrap();
        assert_eq!(uri.method, StoreMethod::Ssh);
        assert_eq!(uri.host.as_deref(), Some("backup.example.com"));
        assert_eq!(uri.path, "pool/snaps/");
    }

    #[test]
    fn s3_store_parses_bucket_and_prefix() {
        let uri: StoreUri = "s3://bucket.example.net/backups/host1/".parse().unwrap();
        assert_eq!(uri.method, StoreMethod::S3);
        assert_eq!(uri.host.as_deref(), Some("bucket.example.net"));
        assert_eq!(uri.path, "backups/host1/");
    }

    #[test]
    fn unknown_method_is_rejected_with_name() {
        let error = "ftp://host/path".parse::<StoreUri>().unwrap_err();
        assert!(error.to_string().contains("ftp"));
    }

    #[test]
    fn dest_normalization_appends_slash() {
        let mut uri: StoreUri = "/mnt/backups".parse().unwrap();
        uri.normalize_dest();
        assert_eq!(uri.path, "/mnt/backups/");
    }
}
