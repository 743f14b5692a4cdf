use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::str::FromStr;

/// Independently toggleable failover flags.
///
/// Any combination is legal. Setting `READ_STRIPING` also sets
/// `ALLOW_READS_FROM_SECONDARIES`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FailoverPolicy(u8);

impl FailoverPolicy {
    pub const ALLOW_READS_FROM_SECONDARIES: FailoverPolicy = FailoverPolicy(0b0001);
    pub const READ_STRIPING: FailoverPolicy = FailoverPolicy(0b0011);
    pub const FAIL_IMMEDIATELY: FailoverPolicy = FailoverPolicy(0b0100);
    pub const ALLOW_READS_FROM_SECONDARIES_WHEN_PRIMARY_DOWN: FailoverPolicy =
        FailoverPolicy(0b1000);

    /// Reads and writes both go to the primary only
    pub const fn primary_only() -> Self {
        FailoverPolicy(0)
    }

    pub const fn contains(&self, other: FailoverPolicy) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn with(self, other: FailoverPolicy) -> Self {
        FailoverPolicy(self.0 | other.0)
    }

    /// Clear the flags in `other`.
    ///
    /// Removing `READ_STRIPING` clears only striping and keeps secondary
    /// reads. Removing `ALLOW_READS_FROM_SECONDARIES` also clears striping.
    pub const fn without(self, other: FailoverPolicy) -> Self {
        let mut mask = other.0;
        if mask & 0b0010 != 0 {
            mask &= !0b0001;
        }
        let mut bits = self.0 & !mask;
        // striping without secondary reads is not representable
        if bits & 0b0001 == 0 {
            bits &= !0b0010;
        }
        FailoverPolicy(bits)
    }

    pub fn allows_secondary_reads(&self) -> bool {
        self.contains(Self::ALLOW_READS_FROM_SECONDARIES)
    }

    pub fn allows_secondaries_when_primary_down(&self) -> bool {
        self.contains(Self::ALLOW_READS_FROM_SECONDARIES_WHEN_PRIMARY_DOWN)
    }

    pub fn read_striping(&self) -> bool {
        self.contains(Self::READ_STRIPING)
    }

    pub fn fail_immediately(&self) -> bool {
        self.contains(Self::FAIL_IMMEDIATELY)
    }

    /// Build a policy from the caller-facing behaviors
    pub fn from_behaviors<'a>(behaviors: impl IntoIterator<Item = &'a FailoverBehavior>) -> Self {
        behaviors
            .into_iter()
            .fold(FailoverPolicy::primary_only(), |policy, behavior| {
                policy | behavior.policy()
            })
    }

    /// Inverse of [`FailoverPolicy::from_behaviors`]
    pub fn behaviors(&self) -> Vec<FailoverBehavior> {
        let mut out = Vec::new();
        if self.read_striping() {
            out.push(FailoverBehavior::ReadFromAllServers);
        } else if self.allows_secondary_reads() {
            out.push(FailoverBehavior::AllowReadsFromSecondaries);
        }
        if self.allows_secondaries_when_primary_down() {
            out.push(FailoverBehavior::ReadFromSecondariesWhenPrimaryIsDown);
        }
        if self.fail_immediately() {
            out.push(FailoverBehavior::FailImmediately);
        }
        if out.is_empty() {
            out.push(FailoverBehavior::ReadFromPrimaryOnly);
        }
        out
    }
}

impl BitOr for FailoverPolicy {
    type Output = FailoverPolicy;

    fn bitor(self, rhs: FailoverPolicy) -> FailoverPolicy {
        self.with(rhs)
    }
}

impl BitOrAssign for FailoverPolicy {
    fn bitor_assign(&mut self, rhs: FailoverPolicy) {
        *self = self.with(rhs);
    }
}

impl fmt::Display for FailoverPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self.behaviors().iter().map(|b| b.to_string()).collect();
        write!(f, "{}", names.join("|"))
    }
}

impl Serialize for FailoverPolicy {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.behaviors().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for FailoverPolicy {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let behaviors = Vec::<FailoverBehavior>::deserialize(deserializer)?;
        Ok(FailoverPolicy::from_behaviors(&behaviors))
    }
}

/// Caller-facing failover configuration surface; combinable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailoverBehavior {
    /// No secondary reads (default)
    ReadFromPrimaryOnly,
    /// Secondary reads in failover order, without striping
    AllowReadsFromSecondaries,
    /// Secondary reads plus read striping
    ReadFromAllServers,
    /// Secondary reads only as fallback when the primary is down
    ReadFromSecondariesWhenPrimaryIsDown,
    /// No chain fallback and no optimistic quarantine expiry
    FailImmediately,
}

impl FailoverBehavior {
    pub fn policy(&self) -> FailoverPolicy {
        match self {
            FailoverBehavior::ReadFromPrimaryOnly => FailoverPolicy::primary_only(),
            FailoverBehavior::AllowReadsFromSecondaries => {
                FailoverPolicy::ALLOW_READS_FROM_SECONDARIES
            }
            FailoverBehavior::ReadFromAllServers => FailoverPolicy::READ_STRIPING,
            FailoverBehavior::ReadFromSecondariesWhenPrimaryIsDown => {
                FailoverPolicy::ALLOW_READS_FROM_SECONDARIES_WHEN_PRIMARY_DOWN
            }
            FailoverBehavior::FailImmediately => FailoverPolicy::FAIL_IMMEDIATELY,
        }
    }
}

impl fmt::Display for FailoverBehavior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailoverBehavior::ReadFromPrimaryOnly => "read_from_primary_only",
            FailoverBehavior::AllowReadsFromSecondaries => "allow_reads_from_secondaries",
            FailoverBehavior::ReadFromAllServers => "read_from_all_servers",
            FailoverBehavior::ReadFromSecondariesWhenPrimaryIsDown => {
                "read_from_secondaries_when_primary_is_down"
            }
            FailoverBehavior::FailImmediately => "fail_immediately",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for FailoverBehavior {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "read_from_primary_only" => Ok(FailoverBehavior::ReadFromPrimaryOnly),
            "allow_reads_from_secondaries" => Ok(FailoverBehavior::AllowReadsFromSecondaries),
            "read_from_all_servers" => Ok(FailoverBehavior::ReadFromAllServers),
            "read_from_secondaries_when_primary_is_down" => {
                Ok(FailoverBehavior::ReadFromSecondariesWhenPrimaryIsDown)
            }
            "fail_immediately" => Ok(FailoverBehavior::FailImmediately),
            other => Err(format!("unknown failover behavior '{}'", other)),
        }
    }
}
