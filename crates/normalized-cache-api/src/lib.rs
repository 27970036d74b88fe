//! Building blocks of the GraphQL normalized cache: records and their keys, the conversion
//! between response trees and records, and the contract every storage backend implements.

pub mod cache;
pub mod cache_key;
pub mod diagnostics;
mod error;
pub mod field_key;
pub mod headers;
pub mod merger;
mod normalizer;
pub mod reader;
mod record;
pub mod resolver;
pub mod selection;

pub use cache::{cascade_keys, key_matches, NormalizedCache, RecordDump};
pub use cache_key::{CacheKey, CacheKeyGenerator, CacheKeyGeneratorContext, IdCacheKeyGenerator, PathCacheKeyGenerator};
pub use error::{CacheError, CacheMissError, StorageError};
pub use field_key::CacheKeyBuilder;
pub use headers::CacheHeaders;
pub use merger::{DefaultRecordMerger, FieldRecordMerger, RecordMerger};
pub use normalizer::normalize;
pub use reader::{read, ReadOutput, ReadRequest};
pub use record::{changed_field_keys, Record, RecordValue};
pub use resolver::{
    CacheResolver, DefaultCacheResolver, FieldPolicyCacheResolver, ReceiveDateCacheResolver, ResolverContext,
};
pub use selection::{
    Argument, ArgumentValue, Condition, Field, Fragment, FragmentSelection, Operation, OperationKind, Selection,
};

/// Operation variables, by name.
pub type Variables = serde_json::Map<String, serde_json::Value>;
