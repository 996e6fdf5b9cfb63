//
// Error generator macro
//
macro_rules! make_error {
    ( $struct:ident; $( $name:ident ( $ty:ty, _): $show_cause:expr ),+ $(,)* ) => {
        #[derive(Debug)]
        #[allow(unused_variables, dead_code)]
        pub enum $struct {
            $($name( $ty, String )),+
        }
        $(impl From<$ty> for $struct {
            fn from(err: $ty) -> Self {
                $struct::$name(err, String::from(stringify!($name)))
            }
        })+
        $(impl From<($ty, String)> for $struct {
            fn from(err: ($ty, String)) -> Self {
                $struct::$name(err.0, err.1)
            }
        })+
        impl $struct {
            pub fn with_msg<M: Into<String>>(self, msg: M) -> Self {
                match self {$(
                   $struct::$name(e, _) => $struct::$name(e, msg.into()),
                )+}
            }

            // First value is log message, second is the caller-facing message.
            pub fn display_error(&self) -> String {
                match self {$(
                   $struct::$name(e, s) => {
                       let log_msg = format!("{}. {}", s, e);
                        ::log::error!("{}", log_msg);
                        if $show_cause {
                            ::log::error!("[CAUSE] {:?}", e);
                        }
                        log_msg
                   },
                )+}
            }
        }

        impl std::fmt::Display for $struct {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                match self {$(
                    $struct::$name(e, s) => write!(f, "{s}: {e}"),
                )+}
            }
        }

        impl std::error::Error for $struct {}
    };
}

/// Wraps a bare string as an error cause, for variants whose source isn't
/// itself an `std::error::Error` (e.g. a driver diagnostic message).
#[derive(Debug)]
pub struct DriverFailure(pub String);

impl std::fmt::Display for DriverFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for DriverFailure {}

// The closed error taxonomy from spec.md §7. Invalid-argument and
// not-registered errors are always local; driver-level query errors are
// conveyed inside QueryResult instead of this type, never as Err(_).
make_error! {
    Error;
    InvalidArgument(String, _): false,
    NotRegistered(String, _): false,
    DriverUnavailable(String, _): false,
    ConnectionFailed(DriverFailure, _): true,
    AllocationFailure(String, _): false,
    TransactionMismatch(String, _): false,
    MigrationStuck(String, _): false,
    IoError(std::io::Error, _): true,
    JsonError(serde_json::Error, _): true,
}

impl Error {
    pub fn new<M: Into<String>, N: Into<String>>(usr_msg: M, log_msg: N) -> Self {
        Error::InvalidArgument(log_msg.into(), usr_msg.into())
    }

    pub fn connection_failed<M: Into<String>>(msg: M) -> Self {
        Error::ConnectionFailed(DriverFailure(msg.into()), String::from("ConnectionFailed"))
    }
}

///
/// Error return macros
///
#[macro_export]
macro_rules! err {
    ($msg:expr) => {{
        return Err($crate::error::Error::new($msg, $msg));
    }};
    ($usr_msg:expr, $log_value:expr) => {{
        return Err($crate::error::Error::new($usr_msg, $log_value));
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_error_includes_message() {
        let e = Error::new("bad thing", "bad thing happened");
        let rendered = e.display_error();
        assert!(rendered.contains("bad thing happened"));
    }

    #[test]
    fn with_msg_overrides_user_message() {
        let e = Error::new("first", "first").with_msg("second");
        match e {
            Error::InvalidArgument(_, msg) => assert_eq!(msg, "second"),
            _ => panic!("unexpected variant"),
        }
    }
}
