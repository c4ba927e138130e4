pub mod StructDebug;
