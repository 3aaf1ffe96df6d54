pub const KIBI: usize = 1024; // 1KB

pub const MEBI: usize = KIBI * KIBI; // 1MB

#[macro_export]
macro_rules! map_err {
    ($variant:ident, $err_ty:ty) => {
        impl From<$err_ty> for Error {
            fn from(err: $err_ty) -> Self {
                Error::$variant(err)
            }
        }
    };
}
