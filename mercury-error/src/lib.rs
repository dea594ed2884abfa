pub mod ext;
pub mod status_code;

// Публичный экспорт трейта расширения и кодов статуса, чтобы упростить доступ
// к ним из внешнего кода.
pub use ext::*;
pub use status_code::*;
