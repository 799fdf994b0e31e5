pub mod queue;
pub mod transport;

// Публичный экспорт всех типов ошибок из вложенных модулей, чтобы упростить
// доступ к ним из внешнего кода.
pub use queue::*;
pub use transport::*;
