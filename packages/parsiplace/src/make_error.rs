#[macro_export]
macro_rules! make_report {
  ($($arg:tt)*) => {
    eyre::eyre!($($arg)*)
  };
}

#[macro_export]
macro_rules! make_error {
  ($($arg:tt)*) => {
    Err($crate::make_report!($($arg)*))
  };
}

#[macro_export]
macro_rules! make_internal_report {
  ($($arg:tt)*) => {
    $crate::make_report!(
      "{}. This is an internal error. Please report it to developers.",
      format!($($arg)*)
    )
  };
}

#[macro_export]
macro_rules! make_internal_error {
  ($($arg:tt)*) => {
    Err($crate::make_internal_report!($($arg)*))
  };
}
