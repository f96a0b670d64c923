//! Client version policy collaborator.

/// Decides whether a SEB client version may connect.
pub trait ClientVersionPolicy: Send + Sync {
    fn accepts(&self, seb_version: &str) -> bool;
}

/// Accepts every client.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAnyVersion;

impl ClientVersionPolicy for AcceptAnyVersion {
    fn accepts(&self, _seb_version: &str) -> bool {
        true
    }
}

/// Accepts versions at or above a dotted numeric minimum.
///
/// Version strings are compared by their leading numeric components, so
/// `"3.6.1 (x64)"` reads as `3.6.1`. Missing components count as zero.
#[derive(Debug, Clone)]
pub struct MinimumVersionPolicy {
    minimum: Vec<u64>,
}

impl MinimumVersionPolicy {
    pub fn new(minimum: &str) -> Self {
        Self { minimum: numeric_components(minimum) }
    }
}

impl ClientVersionPolicy for MinimumVersionPolicy {
    fn accepts(&self, seb_version: &str) -> bool {
        let version = numeric_components(seb_version);
        if version.is_empty() {
            return false;
        }
        let len = version.len().max(self.minimum.len());
        for i in 0..len {
            let have = version.get(i).copied().unwrap_or(0);
            let need = self.minimum.get(i).copied().unwrap_or(0);
            if have != need {
                return have > need;
            }
        }
        true
    }
}

fn numeric_components(version: &str) -> Vec<u64> {
    version
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .split('.')
        .map_while(|part| part.parse().ok())
        .collect()
}
