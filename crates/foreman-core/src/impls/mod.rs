//! Impls - ports の実装
//!
//! # 含まれる実装
//! - **InMemoryWorkStore**: プロセス内の WorkStore（JSON snapshot による永続化つき）
//! - **DependencyGraph**: 前提条件の辺（正方向 + 逆方向）
//!
//! 本番用の永続ストア（SQL など）は `WorkStore` trait を実装した別クレートに置く想定です。

pub mod dependency;
pub mod memory;

// 主要な型を再エクスポート
pub use self::dependency::DependencyGraph;
pub use self::memory::InMemoryWorkStore;
