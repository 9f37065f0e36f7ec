// AetherOS メモリ管理モジュール
//
// GPU MMU 向けのメモリ管理サブシステムを提供します。

pub mod pd_cache;
