//! Member-presence probing for version-dependent layouts.
//!
//! Target builds differ in member names (`delayed_works` vs `inactive_works`)
//! and member types (a plain `struct task_struct *` owner vs a packed
//! `atomic_long_t` owner). Decoders never branch on version numbers; they ask
//! the type description which shape is present and pick a code path once.

use snapdecode_types::{DecodeError, DecodeResult};

use crate::oracle::TypeLayout;

/// Return the first of `candidates` that `ty` actually has.
pub fn first_present<'n>(layout: &dyn TypeLayout, ty: &str, candidates: &[&'n str]) -> Option<&'n str> {
    candidates
        .iter()
        .copied()
        .find(|name| layout.has_member(ty, name))
}

/// Like [`first_present`], but a structural error when none match.
pub fn require_first_present<'n>(
    layout: &dyn TypeLayout,
    ty: &str,
    candidates: &[&'n str],
) -> DecodeResult<&'n str> {
    first_present(layout, ty, candidates)
        .ok_or_else(|| DecodeError::missing_member(ty, &candidates.join("|")))
}

/// Coarse classification of a member's declared type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemberKind {
    /// The member does not exist in this build.
    Absent,
    /// A plain pointer; carries the spelled-out type.
    Pointer(String),
    /// An `atomic_t` / `atomic_long_t` / `atomic64_t` wrapper.
    Atomic,
    /// Anything else; carries the spelled-out type.
    Other(String),
}

/// Classify `ty.member` by its declared type.
pub fn member_kind(layout: &dyn TypeLayout, ty: &str, member: &str) -> MemberKind {
    if !layout.has_member(ty, member) {
        return MemberKind::Absent;
    }
    match layout.member_type(ty, member) {
        Some(name) if name.trim_end().ends_with('*') => MemberKind::Pointer(name),
        Some(name) if name.starts_with("atomic") => MemberKind::Atomic,
        Some(name) => MemberKind::Other(name),
        None => MemberKind::Other(String::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::{MemberDesc, SnapshotImage, TypeDesc};

    fn layout() -> SnapshotImage {
        let mut image = SnapshotImage::new(8);
        image.define_type(
            TypeDesc::new("struct pool_workqueue", 64)
                .member(MemberDesc::new("pool", 0, "struct worker_pool *"))
                .member(MemberDesc::new("delayed_works", 32, "struct list_head")),
        );
        image.define_type(
            TypeDesc::new("struct rw_semaphore", 40)
                .member(MemberDesc::new("count", 0, "atomic_long_t"))
                .member(MemberDesc::new("owner", 8, "atomic_long_t")),
        );
        image
    }

    #[test]
    fn test_first_present_prefers_order() {
        let image = layout();
        let names = ["inactive_works", "delayed_works"];
        assert_eq!(
            first_present(&image, "struct pool_workqueue", &names),
            Some("delayed_works")
        );
        assert_eq!(first_present(&image, "struct pool_workqueue", &["nope"]), None);
    }

    #[test]
    fn test_require_first_present_reports_all_candidates() {
        let image = layout();
        let err = require_first_present(&image, "struct pool_workqueue", &["a", "b"]).unwrap_err();
        assert_eq!(err, DecodeError::missing_member("struct pool_workqueue", "a|b"));
    }

    #[test]
    fn test_member_kind() {
        let image = layout();
        assert_eq!(
            member_kind(&image, "struct pool_workqueue", "pool"),
            MemberKind::Pointer("struct worker_pool *".to_string())
        );
        assert_eq!(member_kind(&image, "struct rw_semaphore", "owner"), MemberKind::Atomic);
        assert_eq!(
            member_kind(&image, "struct pool_workqueue", "delayed_works"),
            MemberKind::Other("struct list_head".to_string())
        );
        assert_eq!(member_kind(&image, "struct rw_semaphore", "wait_list"), MemberKind::Absent);
    }
}
