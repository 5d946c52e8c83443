//! Label and annotation keys read from workloads.

pub const POLICY: &str = "bowline.sh/policy";
pub const TRIGGER: &str = "bowline.sh/trigger";
pub const POLL_SCHEDULE: &str = "bowline.sh/pollSchedule";
pub const MATCH_TAG: &str = "bowline.sh/matchTag";
pub const APPROVALS: &str = "bowline.sh/approvals";
/// Approval deadline in hours
pub const APPROVAL_DEADLINE: &str = "bowline.sh/approvalDeadline";
/// Comma separated notification channels
pub const NOTIFY: &str = "bowline.sh/notify";
pub const RELEASE_NOTES: &str = "bowline.sh/releaseNotes";
pub const IMAGE_PULL_SECRET: &str = "bowline.sh/imagePullSecret";
pub const UPDATE_TIME: &str = "bowline.sh/update-time";

/// Policy label used by earlier releases.
pub const LEGACY_POLICY: &str = "bowline.observer/policy";

pub const CHANGE_CAUSE: &str = "kubernetes.io/change-cause";
