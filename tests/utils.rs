#[macro_export]
macro_rules! here {
    ($e:expr) => {
        format!(
            "{}: {}",
            concat!("at ", file!(), ":", line!(), ":", column!()),
            $e
        )
    };
}
