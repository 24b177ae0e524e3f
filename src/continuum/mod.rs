/// Continuum (hash ring) construction and lookup
///
/// A continuum is a sorted array of `(server index, hash value)` points. It is
/// a pure function of the backend list: the same members always produce the
/// same points, and a membership change always rebuilds from scratch.
///
/// Three distributions share the `locate` interface:
/// - `Ketama`: weighted consistent hashing, 160 points per server scaled by
///   weight share, point values taken from md5 digests of `"<name>-<n>"`.
/// - `Modula`: one point per unit of weight, looked up by `hash % points`.
/// - `Random`: one point per live server; the caller passes a random draw
///   instead of a key hash.
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Points allotted to one server of average weight
pub const KETAMA_POINTS_PER_SERVER: usize = 160;
/// An md5 digest yields four 32-bit points
const KETAMA_POINTS_PER_HASH: usize = 4;

/// Key distribution mode of a pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Distribution {
    #[default]
    Ketama,
    Modula,
    Random,
}

impl fmt::Display for Distribution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Distribution::Ketama => write!(f, "ketama"),
            Distribution::Modula => write!(f, "modula"),
            Distribution::Random => write!(f, "random"),
        }
    }
}

impl FromStr for Distribution {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ketama" => Ok(Distribution::Ketama),
            "modula" => Ok(Distribution::Modula),
            "random" => Ok(Distribution::Random),
            _ => Err(format!("unknown distribution: {}", s)),
        }
    }
}

/// One point on the ring
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContinuumPoint {
    /// Server index within the pool
    pub index: u32,
    /// Hash value (always 0 for modula and random rings)
    pub value: u32,
}

/// A backend as seen by the ring builder
#[derive(Debug, Clone, Copy)]
pub struct RingMember<'a> {
    pub index: usize,
    pub name: &'a str,
    pub weight: u32,
    pub live: bool,
}

#[derive(Debug, Clone)]
pub struct Continuum {
    distribution: Distribution,
    points: Vec<ContinuumPoint>,
    /// Fixed at construction from the full (live and dead) member set
    budget: usize,
    nlive: usize,
}

impl Continuum {
    /// Build a ring sized for every member, populated from the live ones
    pub fn new(distribution: Distribution, members: &[RingMember<'_>]) -> Self {
        let budget = Self::point_budget_for(distribution, members);
        let mut continuum = Self {
            distribution,
            points: Vec::with_capacity(budget),
            budget,
            nlive: 0,
        };
        continuum.rebuild(members);
        continuum
    }

    /// Upper bound on points for a member set, whatever its liveness
    pub fn point_budget_for(distribution: Distribution, members: &[RingMember<'_>]) -> usize {
        match distribution {
            Distribution::Ketama => members.len() * KETAMA_POINTS_PER_SERVER,
            Distribution::Modula => members.iter().map(|m| m.weight as usize).sum(),
            Distribution::Random => members.len(),
        }
    }

    /// Replace every point from the current member snapshot
    pub fn rebuild(&mut self, members: &[RingMember<'_>]) {
        self.points.clear();
        self.nlive = members.iter().filter(|m| m.live).count();

        match self.distribution {
            Distribution::Ketama => self.fill_ketama(members),
            Distribution::Modula => {
                for member in members.iter().filter(|m| m.live) {
                    for _ in 0..member.weight {
                        self.points.push(ContinuumPoint {
                            index: member.index as u32,
                            value: 0,
                        });
                    }
                }
            }
            Distribution::Random => {
                for member in members.iter().filter(|m| m.live) {
                    self.points.push(ContinuumPoint {
                        index: member.index as u32,
                        value: 0,
                    });
                }
            }
        }
    }

    fn fill_ketama(&mut self, members: &[RingMember<'_>]) {
        let total_weight: u64 = members
            .iter()
            .filter(|m| m.live)
            .map(|m| m.weight as u64)
            .sum();
        if total_weight == 0 {
            return;
        }

        // Single precision throughout, so shares that land exactly on a slot
        // boundary round the same way existing ketama rings do.
        let nlive = self.nlive as f32;

        for member in members.iter().filter(|m| m.live) {
            let share = member.weight as f32 / total_weight as f32;
            let slots =
                share * KETAMA_POINTS_PER_SERVER as f32 / KETAMA_POINTS_PER_HASH as f32 * nlive;
            let per_server = slots.floor() as usize * KETAMA_POINTS_PER_HASH;

            for seq in 0..per_server / KETAMA_POINTS_PER_HASH {
                let host = format!("{}-{}", member.name, seq);
                let digest = md5::compute(host.as_bytes());
                for word in digest.chunks_exact(4) {
                    self.points.push(ContinuumPoint {
                        index: member.index as u32,
                        value: u32::from_le_bytes([word[0], word[1], word[2], word[3]]),
                    });
                }
            }
        }

        self.points.sort_unstable_by_key(|p| (p.value, p.index));
    }

    /// Map a hash to a server index, or `None` when no server is live
    ///
    /// Ketama picks the first point whose value is `>= hash`, wrapping to the
    /// first point past the end. Modula and random index `hash % points`.
    pub fn locate(&self, hash: u32) -> Option<usize> {
        if self.points.is_empty() {
            return None;
        }

        let point = match self.distribution {
            Distribution::Ketama => {
                let pos = self.points.partition_point(|p| p.value < hash);
                if pos == self.points.len() {
                    &self.points[0]
                } else {
                    &self.points[pos]
                }
            }
            Distribution::Modula | Distribution::Random => {
                &self.points[hash as usize % self.points.len()]
            }
        };

        Some(point.index as usize)
    }

    pub fn distribution(&self) -> Distribution {
        self.distribution
    }

    pub fn points(&self) -> &[ContinuumPoint] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn point_budget(&self) -> usize {
        self.budget
    }

    /// Live servers at the last rebuild
    pub fn live_count(&self) -> usize {
        self.nlive
    }

    /// Number of points owned by one server
    pub fn points_for(&self, index: usize) -> usize {
        self.points
            .iter()
            .filter(|p| p.index as usize == index)
            .count()
    }
}
