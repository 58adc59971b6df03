/// Sudoku 流量混淆核心
///
/// 分层：table（编解码表）→ stream（逐字节 Sudoku 流）/ packed（6bit
/// 打包下行）→ httpmask（起始伪装）。表构建开销较大，按配置构建一次后
/// 以 Arc 在所有连接间共享；每个流实例单独从系统熵播种 PRNG。
pub mod grid;
pub mod httpmask;
pub mod layout;
pub mod packed;
pub mod stream;
pub mod table;

pub use packed::PackedStream;
pub use stream::{Recorder, SudokuStream};
pub use table::{Table, TableSet};
