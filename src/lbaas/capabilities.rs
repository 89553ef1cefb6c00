//! Backend capability set
//!
//! Features of the load-balancing API depend on its version and on the
//! provider driver behind a load balancer. They are resolved once when the
//! engine is constructed and passed around as plain data.

use super::types::ApiVersion;

/// Provider driver that does not implement listener timeouts or VIP ACLs
pub const OVN_PROVIDER: &str = "ovn";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Feature {
    /// Resource tags
    Tags,
    /// Listener `timeout_*` fields
    Timeouts,
    /// Load balancer flavors
    Flavors,
    /// Listener `allowed_cidrs`
    VipAcl,
    /// Load balancer availability zones
    AvailabilityZones,
}

impl Feature {
    /// First API version that ships the feature
    pub fn min_version(&self) -> ApiVersion {
        match self {
            Feature::Timeouts => ApiVersion::new(2, 1),
            Feature::Tags => ApiVersion::new(2, 5),
            Feature::Flavors => ApiVersion::new(2, 6),
            Feature::VipAcl => ApiVersion::new(2, 12),
            Feature::AvailabilityZones => ApiVersion::new(2, 14),
        }
    }
}

/// Whether `feature` is usable at `version` for load balancers of `provider`
pub fn is_feature_supported(version: ApiVersion, feature: Feature, provider: &str) -> bool {
    if version < feature.min_version() {
        return false;
    }
    match feature {
        Feature::Timeouts | Feature::VipAcl => !provider.eq_ignore_ascii_case(OVN_PROVIDER),
        _ => true,
    }
}

/// Capability set resolved for one engine instance
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Capabilities {
    pub version: ApiVersion,
    pub provider: String,
    pub tags: bool,
    pub timeouts: bool,
    pub flavors: bool,
    pub vip_acl: bool,
    pub availability_zones: bool,
    /// Delete whole load-balancer trees with a single cascading call
    pub cascade_delete: bool,
}

impl Capabilities {
    pub fn resolve(version: ApiVersion, provider: &str, cascade_delete: bool) -> Self {
        let supported = |feature| is_feature_supported(version, feature, provider);
        Self {
            version,
            provider: provider.to_string(),
            tags: supported(Feature::Tags),
            timeouts: supported(Feature::Timeouts),
            flavors: supported(Feature::Flavors),
            vip_acl: supported(Feature::VipAcl),
            availability_zones: supported(Feature::AvailabilityZones),
            cascade_delete,
        }
    }

    pub fn supports(&self, feature: Feature) -> bool {
        match feature {
            Feature::Tags => self.tags,
            Feature::Timeouts => self.timeouts,
            Feature::Flavors => self.flavors,
            Feature::VipAcl => self.vip_acl,
            Feature::AvailabilityZones => self.availability_zones,
        }
    }
}
