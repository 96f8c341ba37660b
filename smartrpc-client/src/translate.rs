//! Translation of server error tuples into typed errors.
//!
//! A server reports failures as a tuple whose first element is a tag from a
//! fixed vocabulary. Some errors can only be rendered with local knowledge
//! (the branch or repository the call was about), which the caller supplies
//! through an [`ErrorContext`].

use bytes::Bytes;
use smartrpc_protocol::message::parse_int;
use std::fmt;
use thiserror::Error;

/// A raw error tuple as received from the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorTuple(pub Vec<Bytes>);

impl ErrorTuple {
    pub fn new(args: Vec<Bytes>) -> Self {
        Self(args)
    }

    /// The error tag, or an empty slice for an empty tuple.
    pub fn tag(&self) -> &[u8] {
        self.0.first().map(|b| &b[..]).unwrap_or(b"")
    }

    pub fn args(&self) -> &[Bytes] {
        &self.0
    }

    /// Element `index` decoded as (lossy) UTF-8.
    pub fn arg_str(&self, index: usize) -> Option<String> {
        self.0
            .get(index)
            .map(|b| String::from_utf8_lossy(b).into_owned())
    }
}

impl fmt::Display for ErrorTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, arg) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{:?}", String::from_utf8_lossy(arg))?;
        }
        write!(f, ")")
    }
}

/// Local objects a translation may need, identified by display name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorContext {
    pub branch: Option<String>,
    pub other_branch: Option<String>,
    pub repository: Option<String>,
    pub bzrdir: Option<String>,
    pub path: Option<String>,
    pub token: Option<String>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }

    pub fn with_other_branch(mut self, branch: impl Into<String>) -> Self {
        self.other_branch = Some(branch.into());
        self
    }

    pub fn with_repository(mut self, repository: impl Into<String>) -> Self {
        self.repository = Some(repository.into());
        self
    }

    pub fn with_bzrdir(mut self, bzrdir: impl Into<String>) -> Self {
        self.bzrdir = Some(bzrdir.into());
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }
}

/// An error reported by the server, translated into a typed form.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SmartError {
    #[error("revision {revision} not present in branch {branch}")]
    NoSuchRevision { branch: String, revision: String },

    #[error("revision {revision} not present in repository {repository}")]
    NoSuchRevisionInRepository { repository: String, revision: String },

    #[error("not a branch: {path}{}", .detail.as_deref().map(|d| format!(" ({})", d)).unwrap_or_default())]
    NotBranch { path: String, detail: Option<String> },

    #[error("no repository present: {bzrdir}")]
    NoRepositoryPresent { bzrdir: String },

    #[error("cannot lock {bzrdir}: the transport does not support locking")]
    UnlockableTransport { bzrdir: String },

    #[error("lock token mismatch: {expected} != {received}")]
    TokenMismatch { expected: String, received: String },

    #[error("branches have diverged: {branch} and {other_branch}")]
    Diverged { branch: String, other_branch: String },

    #[error("branch {branch} is not stacked")]
    NotStacked { branch: String },

    #[error("permission denied: {path}{}", .extra.as_deref().map(|e| format!(": {}", e)).unwrap_or_default())]
    PermissionDenied { path: String, extra: Option<String> },

    #[error("error reading from {path}")]
    ReadError { path: String },

    #[error("no such file: {path}")]
    NoSuchFile { path: String },

    #[error("file exists: {path}")]
    FileExists { path: String },

    #[error("directory not empty: {path}")]
    DirectoryNotEmpty { path: String },

    #[error("short readv of {path}: wanted {length} bytes at {offset}, got {actual}")]
    ShortReadv {
        path: String,
        offset: u64,
        length: u64,
        actual: u64,
    },

    #[error("{kind}: {encoding} codec can't handle {value:?} in position {start}-{end}: {reason}")]
    Unicode {
        kind: String,
        encoding: String,
        value: String,
        start: u64,
        end: u64,
        reason: String,
    },

    #[error("transport is read-only")]
    ReadOnly,

    #[error("remote server out of memory\nRetry non-remotely, or contact the server admin for details.")]
    RemoteOutOfMemory,

    #[error("revision {revision} not present for file {file_id}")]
    RevisionNotPresent { revision: String, file_id: String },

    #[error("could not acquire lock {lock}")]
    LockContention { lock: String },

    #[error("cannot lock {lock}: {why}")]
    LockFailed { lock: String, why: String },

    #[error("repository {target_repository} is not compatible with repository {source_repository}{}", .details.as_deref().map(|d| format!(": {}", d)).unwrap_or_default())]
    IncompatibleRepositories {
        source_repository: String,
        target_repository: String,
        details: Option<String>,
    },

    #[error("repository {repository} cannot suspend a write group")]
    UnsuspendableWriteGroup { repository: String },

    #[error("repository {repository} cannot resume write group {tokens}: {reason}")]
    UnresumableWriteGroup {
        repository: String,
        tokens: String,
        reason: String,
    },

    #[error("cannot determine revno for {revision} because its ancestry shows a ghost at {ghost}")]
    GhostRevisionsHaveNoRevno { revision: String, ghost: String },

    #[error("internal check failed on the server: {message}")]
    BzrCheck { message: String },

    #[error("tip change rejected: {message}")]
    TipChangeRejected { message: String },

    #[error("server error: {message}")]
    Generic { message: String },

    #[error("unknown error from server: {tuple}")]
    Unknown {
        tuple: ErrorTuple,
        /// Context key that was needed but not supplied.
        missing_key: Option<&'static str>,
    },
}

impl SmartError {
    /// Returns whether repeating the operation could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SmartError::LockContention { .. })
    }
}

enum Untranslatable {
    UnknownTag,
    MissingKey(&'static str),
    BadPayload(usize),
}

struct Rule<'a> {
    tuple: &'a ErrorTuple,
    context: &'a ErrorContext,
}

impl<'a> Rule<'a> {
    fn find(&self, key: &'static str) -> Result<String, Untranslatable> {
        let value = match key {
            "branch" => &self.context.branch,
            "other_branch" => &self.context.other_branch,
            "repository" => &self.context.repository,
            "bzrdir" => &self.context.bzrdir,
            "path" => &self.context.path,
            "token" => &self.context.token,
            _ => &None,
        };
        value.clone().ok_or(Untranslatable::MissingKey(key))
    }

    fn arg(&self, index: usize) -> Result<String, Untranslatable> {
        self.tuple
            .arg_str(index)
            .ok_or(Untranslatable::BadPayload(index))
    }

    fn int(&self, index: usize) -> Result<u64, Untranslatable> {
        self.tuple
            .args()
            .get(index)
            .and_then(|raw| parse_int(raw).ok())
            .and_then(|n| u64::try_from(n).ok())
            .ok_or(Untranslatable::BadPayload(index))
    }

    /// The local path if the caller knows it, else the one on the wire.
    fn path(&self) -> Result<String, Untranslatable> {
        match &self.context.path {
            Some(path) => Ok(path.clone()),
            None => self.arg(1),
        }
    }

    fn translate(&self) -> Result<SmartError, Untranslatable> {
        let err = match self.tuple.tag() {
            b"NoSuchRevision" => SmartError::NoSuchRevision {
                branch: self.find("branch")?,
                revision: self.arg(1)?,
            },
            b"nosuchrevision" => SmartError::NoSuchRevisionInRepository {
                repository: self.find("repository")?,
                revision: self.arg(1)?,
            },
            b"nobranch" | b"NotBranchError" => SmartError::NotBranch {
                path: self.find("bzrdir")?,
                detail: self.tuple.arg_str(1),
            },
            b"norepository" | b"NoRepositoryPresent" => SmartError::NoRepositoryPresent {
                bzrdir: self.find("bzrdir")?,
            },
            b"UnlockableTransport" => SmartError::UnlockableTransport {
                bzrdir: self.find("bzrdir")?,
            },
            b"TokenMismatch" => SmartError::TokenMismatch {
                expected: self.find("token")?,
                received: "(remote token)".to_string(),
            },
            b"Diverged" => SmartError::Diverged {
                branch: self.find("branch")?,
                other_branch: self.find("other_branch")?,
            },
            b"NotStacked" => SmartError::NotStacked {
                branch: self.find("branch")?,
            },
            b"PermissionDenied" => SmartError::PermissionDenied {
                path: self.path()?,
                extra: self.tuple.arg_str(2),
            },
            b"ReadError" => SmartError::ReadError { path: self.path()? },
            b"NoSuchFile" => SmartError::NoSuchFile { path: self.path()? },
            b"FileExists" => SmartError::FileExists { path: self.arg(1)? },
            b"DirectoryNotEmpty" => SmartError::DirectoryNotEmpty { path: self.arg(1)? },
            b"ShortReadvError" => SmartError::ShortReadv {
                path: self.path()?,
                offset: self.int(2)?,
                length: self.int(3)?,
                actual: self.int(4)?,
            },
            tag @ (b"UnicodeEncodeError" | b"UnicodeDecodeError") => SmartError::Unicode {
                kind: String::from_utf8_lossy(tag).into_owned(),
                encoding: self.arg(1)?,
                value: self.arg(2)?,
                start: self.int(3)?,
                end: self.int(4)?,
                reason: self.arg(5)?,
            },
            b"ReadOnlyError" => SmartError::ReadOnly,
            b"MemoryError" => SmartError::RemoteOutOfMemory,
            b"RevisionNotPresent" => SmartError::RevisionNotPresent {
                revision: self.arg(1)?,
                file_id: self.arg(2)?,
            },
            b"LockContention" => SmartError::LockContention {
                lock: "(remote lock)".to_string(),
            },
            b"LockFailed" => SmartError::LockFailed {
                lock: self.arg(1)?,
                why: self.arg(2)?,
            },
            b"IncompatibleRepositories" => SmartError::IncompatibleRepositories {
                source_repository: self.arg(1)?,
                target_repository: self.arg(2)?,
                details: self.tuple.arg_str(3),
            },
            b"UnsuspendableWriteGroup" => SmartError::UnsuspendableWriteGroup {
                repository: self.find("repository")?,
            },
            b"UnresumableWriteGroup" => SmartError::UnresumableWriteGroup {
                repository: self.find("repository")?,
                tokens: self.arg(1)?,
                reason: self.arg(2)?,
            },
            b"GhostRevisionsHaveNoRevno" => SmartError::GhostRevisionsHaveNoRevno {
                revision: self.arg(1)?,
                ghost: self.arg(2)?,
            },
            b"BzrCheckError" => SmartError::BzrCheck {
                message: self.arg(1)?,
            },
            b"TipChangeRejected" => SmartError::TipChangeRejected {
                message: self.arg(1)?,
            },
            b"error" => SmartError::Generic {
                message: (1..self.tuple.args().len())
                    .filter_map(|i| self.tuple.arg_str(i))
                    .collect::<Vec<_>>()
                    .join(" "),
            },
            _ => return Err(Untranslatable::UnknownTag),
        };
        Ok(err)
    }
}

/// Translates `tuple` using the local objects in `context`.
///
/// Never fails: unknown tags, missing context and malformed payloads all
/// produce [`SmartError::Unknown`] carrying the original tuple.
pub fn translate_error(tuple: ErrorTuple, context: &ErrorContext) -> SmartError {
    let outcome = Rule {
        tuple: &tuple,
        context,
    }
    .translate();
    match outcome {
        Ok(err) => err,
        Err(Untranslatable::UnknownTag) => SmartError::Unknown {
            tuple,
            missing_key: None,
        },
        Err(Untranslatable::MissingKey(key)) => {
            tracing::warn!(
                "Missing key {:?} in context {:?} while translating {}",
                key,
                context,
                tuple
            );
            SmartError::Unknown {
                tuple,
                missing_key: Some(key),
            }
        }
        Err(Untranslatable::BadPayload(index)) => {
            tracing::debug!("Malformed element {} in error tuple {}", index, tuple);
            SmartError::Unknown {
                tuple,
                missing_key: None,
            }
        }
    }
}
