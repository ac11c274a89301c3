//! Agent command protocol vocabulary shared by the daemon and its clients.
//!
//! A request is one framed message whose type byte is the action code and
//! whose body is `identifier NUL value`. Every request that is not
//! [`Action::Finish`] gets exactly one [`RESPONSE_MESSAGE`] back, whose body
//! is a counted text.

use std::fmt;
use std::str::FromStr;

/// Type byte of every daemon response.
pub const RESPONSE_MESSAGE: u8 = b'M';

/// Separates the identifier from the value in a request body.
pub const SEPARATOR: u8 = 0;

/// Default bound on the self-inclusive length of a request frame.
pub const DEFAULT_MAX_PARAMETER_LENGTH: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Component {
    Hdfs,
    Yarn,
    MapReduce,
    HBase,
    ZooKeeper,
    Kafka,
    Spark,
}

impl Component {
    pub const ALL: [Component; 7] = [
        Component::Hdfs,
        Component::Yarn,
        Component::MapReduce,
        Component::HBase,
        Component::ZooKeeper,
        Component::Kafka,
        Component::Spark,
    ];

    /// Lower-case identifier used in requests, config keys and paths.
    pub const fn id(self) -> &'static str {
        match self {
            Component::Hdfs => "hdfs",
            Component::Yarn => "yarn",
            Component::MapReduce => "mapreduce",
            Component::HBase => "hbase",
            Component::ZooKeeper => "zookeeper",
            Component::Kafka => "kafka",
            Component::Spark => "spark",
        }
    }

    /// Name used in status text.
    pub const fn display_name(self) -> &'static str {
        match self {
            Component::Hdfs => "HDFS",
            Component::Yarn => "YARN",
            Component::MapReduce => "MapReduce",
            Component::HBase => "HBase",
            Component::ZooKeeper => "ZooKeeper",
            Component::Kafka => "Kafka",
            Component::Spark => "Spark",
        }
    }

    /// Action code that sets one of this component's parameters.
    pub const fn set_code(self) -> u8 {
        match self {
            Component::Hdfs => b'h',
            Component::Yarn => b'y',
            Component::MapReduce => b'm',
            Component::HBase => b'b',
            Component::ZooKeeper => b'z',
            Component::Kafka => b'k',
            Component::Spark => b's',
        }
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownComponent(pub String);

impl fmt::Display for UnknownComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown component '{}'", self.0)
    }
}

impl std::error::Error for UnknownComponent {}

impl FromStr for Component {
    type Err = UnknownComponent;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Component::ALL
            .into_iter()
            .find(|c| c.id().eq_ignore_ascii_case(raw.trim()))
            .ok_or_else(|| UnknownComponent(raw.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleAction {
    Start,
    Stop,
    Restart,
    Install,
    Uninstall,
    Configure,
}

impl LifecycleAction {
    pub const ALL: [LifecycleAction; 6] = [
        LifecycleAction::Start,
        LifecycleAction::Stop,
        LifecycleAction::Restart,
        LifecycleAction::Install,
        LifecycleAction::Uninstall,
        LifecycleAction::Configure,
    ];

    pub const fn code(self) -> u8 {
        match self {
            LifecycleAction::Start => b'S',
            LifecycleAction::Stop => b'T',
            LifecycleAction::Restart => b'R',
            LifecycleAction::Install => b'I',
            LifecycleAction::Uninstall => b'U',
            LifecycleAction::Configure => b'C',
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            LifecycleAction::Start => "start",
            LifecycleAction::Stop => "stop",
            LifecycleAction::Restart => "restart",
            LifecycleAction::Install => "install",
            LifecycleAction::Uninstall => "uninstall",
            LifecycleAction::Configure => "configure",
        }
    }
}

impl fmt::Display for LifecycleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Decoded request type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Body: `component NUL arg NUL arg ...`
    Lifecycle(LifecycleAction),
    /// Body: `parameter NUL value`
    SetParameter(Component),
    /// Body: empty. Ends the session without a response.
    Finish,
}

impl Action {
    pub const FINISH_CODE: u8 = b'X';

    pub fn from_code(code: u8) -> Option<Action> {
        if code == Self::FINISH_CODE {
            return Some(Action::Finish);
        }
        if let Some(action) = LifecycleAction::ALL.into_iter().find(|a| a.code() == code) {
            return Some(Action::Lifecycle(action));
        }
        Component::ALL
            .into_iter()
            .find(|c| c.set_code() == code)
            .map(Action::SetParameter)
    }

    pub fn code(self) -> u8 {
        match self {
            Action::Lifecycle(action) => action.code(),
            Action::SetParameter(component) => component.set_code(),
            Action::Finish => Self::FINISH_CODE,
        }
    }
}

/// Split a request body at the first separator. A body without one is all
/// identifier.
pub fn split_body(body: &[u8]) -> (&[u8], &[u8]) {
    match body.iter().position(|b| *b == SEPARATOR) {
        Some(at) => (&body[..at], &body[at + 1..]),
        None => (body, &[]),
    }
}

/// Build a request body from an identifier and its values.
pub fn join_body(identifier: &str, values: &[&str]) -> Vec<u8> {
    let mut body = identifier.as_bytes().to_vec();
    for value in values {
        body.push(SEPARATOR);
        body.extend_from_slice(value.as_bytes());
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_codes_are_distinct_and_decode_back() {
        let mut codes: Vec<u8> = LifecycleAction::ALL.iter().map(|a| a.code()).collect();
        codes.extend(Component::ALL.iter().map(|c| c.set_code()));
        codes.push(Action::FINISH_CODE);
        let mut sorted = codes.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), codes.len());

        for code in codes {
            let action = Action::from_code(code).expect("known code");
            assert_eq!(action.code(), code);
        }
        assert_eq!(Action::from_code(b'Q'), None);
    }

    #[test]
    fn component_ids_parse_case_insensitively() {
        assert_eq!("HDFS".parse::<Component>(), Ok(Component::Hdfs));
        assert_eq!("zookeeper".parse::<Component>(), Ok(Component::ZooKeeper));
        assert!("cassandra".parse::<Component>().is_err());
        assert_eq!(Component::HBase.to_string(), "HBase");
    }

    #[test]
    fn body_splits_on_first_separator() {
        assert_eq!(
            split_body(b"hdfs.replication\x003"),
            (&b"hdfs.replication"[..], &b"3"[..])
        );
        assert_eq!(split_body(b"a\0b\0c"), (&b"a"[..], &b"b\0c"[..]));
        assert_eq!(split_body(b"alone"), (&b"alone"[..], &b""[..]));
        assert_eq!(join_body("kafka", &["--force", "now"]), b"kafka\0--force\0now");
    }
}
