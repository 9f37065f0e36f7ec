// AetherOS メモリ管理テスト
