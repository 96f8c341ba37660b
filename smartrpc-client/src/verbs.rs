//! Registry of well-known verbs and whether they may be sent twice.

use std::fmt;

/// How a verb behaves if the server executes it twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerbSafety {
    /// Has no side effects.
    Read,
    /// Repeating it leaves the same result.
    Idempotent,
    /// Has side effects, but a repeat fails cleanly instead of doing harm.
    SemiIdempotent,
    /// A VFS operation whose repeat may report a spurious error.
    SemiVfs,
    /// Repeating it is unsafe.
    Mutate,
    /// Consumes a body stream that cannot be replayed.
    Stream,
}

impl VerbSafety {
    /// Whether a request may be re-sent after the connection dropped while
    /// waiting for its response.
    pub fn is_safe_to_send_twice(&self) -> bool {
        matches!(
            self,
            VerbSafety::Read | VerbSafety::Idempotent | VerbSafety::SemiIdempotent
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            VerbSafety::Read => "read",
            VerbSafety::Idempotent => "idem",
            VerbSafety::SemiIdempotent => "semi",
            VerbSafety::SemiVfs => "semivfs",
            VerbSafety::Mutate => "mutate",
            VerbSafety::Stream => "stream",
        }
    }
}

impl fmt::Display for VerbSafety {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

use VerbSafety::*;

const VERBS: &[(&str, VerbSafety)] = &[
    ("append", Mutate),
    ("Branch.break_lock", Idempotent),
    ("Branch.get_config_file", Read),
    ("Branch.get_parent", Read),
    ("Branch.get_physical_lock_status", Read),
    ("Branch.get_stacked_on_url", Read),
    ("Branch.get_tags_bytes", Read),
    ("Branch.heads_to_fetch", Read),
    ("Branch.last_revision_info", Read),
    ("Branch.lock_write", SemiIdempotent),
    ("Branch.put_config_file", Idempotent),
    ("Branch.revision_history", Read),
    ("Branch.revision_id_to_revno", Read),
    ("Branch.set_config_option", Idempotent),
    ("Branch.set_config_option_dict", Idempotent),
    ("Branch.set_last_revision", Idempotent),
    ("Branch.set_last_revision_ex", Idempotent),
    ("Branch.set_last_revision_info", Idempotent),
    ("Branch.set_parent_location", Idempotent),
    ("Branch.set_tags_bytes", Idempotent),
    ("Branch.unlock", SemiIdempotent),
    ("BzrDir.checkout_metadir", Read),
    ("BzrDir.cloning_metadir", Read),
    ("BzrDir.create_branch", SemiIdempotent),
    ("BzrDir.create_repository", SemiIdempotent),
    ("BzrDir.destroy_branch", SemiIdempotent),
    ("BzrDir.destroy_repository", SemiIdempotent),
    ("BzrDir.find_repository", Read),
    ("BzrDir.find_repositoryV2", Read),
    ("BzrDir.find_repositoryV3", Read),
    ("BzrDir.get_branches", Read),
    ("BzrDir.get_config_file", Read),
    ("BzrDir.has_workingtree", Read),
    ("BzrDir.open", Read),
    ("BzrDir.open_2.1", Read),
    ("BzrDir.open_branch", Read),
    ("BzrDir.open_branchV2", Read),
    ("BzrDir.open_branchV3", Read),
    ("BzrDir.put_config_file", Idempotent),
    ("BzrDirFormat.initialize", SemiIdempotent),
    ("BzrDirFormat.initialize_ex_1.16", SemiIdempotent),
    ("delete", SemiVfs),
    ("get", Read),
    ("get_bundle", Read),
    ("has", Read),
    ("hello", Read),
    ("iter_files_recursive", Read),
    ("list_dir", Read),
    ("mkdir", SemiVfs),
    ("move", SemiVfs),
    ("PackRepository.autopack", Idempotent),
    ("put", Idempotent),
    ("put_non_atomic", Idempotent),
    ("readv", Read),
    ("rename", SemiVfs),
    ("Repository.abort_write_group", SemiIdempotent),
    ("Repository.add_signature_text", Idempotent),
    ("Repository.all_revision_ids", Read),
    ("Repository.break_lock", Idempotent),
    ("Repository.check_write_group", Read),
    ("Repository.commit_write_group", SemiIdempotent),
    ("Repository.gather_stats", Read),
    ("Repository.get_inventories", Read),
    ("Repository.get_parent_map", Read),
    ("Repository.get_physical_lock_status", Read),
    ("Repository.get_rev_id_for_revno", Read),
    ("Repository.get_revision_graph", Read),
    ("Repository.get_revision_signature_text", Read),
    ("Repository.get_serializer_format", Read),
    ("Repository.get_stream", Read),
    ("Repository.get_stream_1.19", Read),
    ("Repository.get_stream_for_missing_keys", Read),
    ("Repository.has_revision", Read),
    ("Repository.has_revisions", Read),
    ("Repository.has_signature_for_revision_id", Read),
    ("Repository.insert_stream", Stream),
    ("Repository.insert_stream_1.19", Stream),
    ("Repository.insert_stream_locked", Stream),
    ("Repository.is_shared", Read),
    ("Repository.iter_files_bytes", Read),
    ("Repository.iter_revisions", Read),
    ("Repository.lock_write", SemiIdempotent),
    ("Repository.make_working_trees", Read),
    ("Repository.pack", Idempotent),
    ("Repository.reconcile", Idempotent),
    ("Repository.revision_archive", Read),
    ("Repository.set_make_working_trees", Idempotent),
    ("Repository.start_write_group", SemiIdempotent),
    ("Repository.tarball", Read),
    ("Repository.unlock", SemiIdempotent),
    ("rmdir", SemiVfs),
    ("stat", Read),
    ("Transport.is_readonly", Read),
    ("VersionedFileRepository.get_inventories", Read),
    ("VersionedFileRepository.get_serializer_format", Read),
];

/// Looks up the safety class of a registered verb.
pub fn verb_safety(method: &[u8]) -> Option<VerbSafety> {
    VERBS
        .iter()
        .find(|(name, _)| name.as_bytes() == method)
        .map(|(_, safety)| *safety)
}

/// Whether `method` may be re-sent after a connection reset while reading
/// its response. Verbs missing from the registry are assumed safe.
pub fn is_safe_to_send_twice(method: &[u8]) -> bool {
    match verb_safety(method) {
        Some(safety) => safety.is_safe_to_send_twice(),
        None => {
            tracing::debug!(
                "Unregistered verb {:?}, assuming it is safe to retry",
                String::from_utf8_lossy(method)
            );
            true
        }
    }
}
