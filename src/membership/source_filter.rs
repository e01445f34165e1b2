use crate::error::GatewayError;
use crate::packet::membership::is_ssm_group;
use std::collections::BTreeSet;
use std::fmt::{Debug, Formatter};
use std::net::IpAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterMode {
    Include,
    Exclude,
}

/// What a host wants to receive for one multicast group: either exactly the listed sources
///  (INCLUDE), or everything except the listed sources (EXCLUDE).
///
/// INCLUDE with no sources means "no interest", EXCLUDE with no sources means "all sources".
#[derive(Clone, PartialEq, Eq)]
pub struct SourceFilter {
    mode: FilterMode,
    sources: BTreeSet<IpAddr>,
}

impl Debug for SourceFilter {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let mode = match self.mode {
            FilterMode::Include => "IN",
            FilterMode::Exclude => "EX",
        };
        write!(f, "{}{:?}", mode, self.sources)
    }
}

impl Default for SourceFilter {
    fn default() -> Self {
        SourceFilter::no_interest()
    }
}

impl SourceFilter {
    pub fn new(mode: FilterMode, sources: impl IntoIterator<Item = IpAddr>) -> SourceFilter {
        SourceFilter {
            mode,
            sources: sources.into_iter().collect(),
        }
    }

    /// Strict constructor for filters coming in through an API: duplicate sources are rejected
    ///  rather than silently merged.
    pub fn try_new(mode: FilterMode, sources: &[IpAddr]) -> Result<SourceFilter, GatewayError> {
        let set: BTreeSet<IpAddr> = sources.iter().cloned().collect();
        if set.len() != sources.len() {
            return Err(GatewayError::InvalidFilterOperation(format!("duplicate sources in {:?}", sources)));
        }
        Ok(SourceFilter { mode, sources: set })
    }

    pub fn include(sources: impl IntoIterator<Item = IpAddr>) -> SourceFilter {
        Self::new(FilterMode::Include, sources)
    }

    pub fn exclude(sources: impl IntoIterator<Item = IpAddr>) -> SourceFilter {
        Self::new(FilterMode::Exclude, sources)
    }

    pub fn all_sources() -> SourceFilter {
        Self::exclude([])
    }

    pub fn no_interest() -> SourceFilter {
        Self::include([])
    }

    pub fn mode(&self) -> FilterMode {
        self.mode
    }

    pub fn sources(&self) -> &BTreeSet<IpAddr> {
        &self.sources
    }

    /// true exactly if the filter selects no traffic at all, i.e. INCLUDE with no sources
    pub fn is_empty(&self) -> bool {
        self.mode == FilterMode::Include && self.sources.is_empty()
    }

    /// whether traffic from `source` passes the filter
    pub fn accepts(&self, source: &IpAddr) -> bool {
        match self.mode {
            FilterMode::Include => self.sources.contains(source),
            FilterMode::Exclude => !self.sources.contains(source),
        }
    }

    pub fn add_sources<'a>(&mut self, sources: impl IntoIterator<Item = &'a IpAddr>) {
        self.sources.extend(sources);
    }

    pub fn remove_sources<'a>(&mut self, sources: impl IntoIterator<Item = &'a IpAddr>) {
        for s in sources {
            self.sources.remove(s);
        }
    }

    /// Changes the filter mode, keeping the source list
    pub fn set_mode(&mut self, mode: FilterMode) {
        self.mode = mode;
    }

    /// The filter receiving everything that either filter receives. This is how interest from
    ///  several joins of the same group is combined:
    ///
    /// * INCLUDE(A) + INCLUDE(B) = INCLUDE(A ∪ B)
    /// * EXCLUDE(A) + EXCLUDE(B) = EXCLUDE(A ∩ B)
    /// * INCLUDE(A) + EXCLUDE(B) = EXCLUDE(B - A)
    pub fn union(&self, other: &SourceFilter) -> SourceFilter {
        match (self.mode, other.mode) {
            (FilterMode::Include, FilterMode::Include) => SourceFilter::include(self.sources.union(&other.sources).cloned()),
            (FilterMode::Exclude, FilterMode::Exclude) => SourceFilter::exclude(self.sources.intersection(&other.sources).cloned()),
            (FilterMode::Include, FilterMode::Exclude) => SourceFilter::exclude(other.sources.difference(&self.sources).cloned()),
            (FilterMode::Exclude, FilterMode::Include) => SourceFilter::exclude(self.sources.difference(&other.sources).cloned()),
        }
    }

    /// Checks that the filter can be requested for `group`
    pub fn validate_for_group(&self, group: &IpAddr) -> Result<(), GatewayError> {
        if !group.is_multicast() {
            return Err(GatewayError::InvalidFilterOperation(format!("{} is not a multicast address", group)));
        }
        for source in &self.sources {
            if source.is_ipv4() != group.is_ipv4() {
                return Err(GatewayError::InvalidFilterOperation(format!("source {} does not match the address family of group {}", source, group)));
            }
            if source.is_multicast() || source.is_unspecified() {
                return Err(GatewayError::InvalidFilterOperation(format!("{} is not a valid source address", source)));
            }
        }
        if self.mode == FilterMode::Exclude && is_ssm_group(group) {
            return Err(GatewayError::InvalidFilterOperation(format!("EXCLUDE mode is not allowed for source specific group {}", group)));
        }
        Ok(())
    }
}
