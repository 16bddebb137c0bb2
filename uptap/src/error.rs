// Copyright 2026 Authors of uptap
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

#[derive(Debug)]
pub enum Error {
    StringConversion,
    /// A probe descriptor failed validation. The payload says which rule.
    InvalidDescriptor(String),
    Parse(::goblin::error::Error),
    IO(::std::io::Error),
    Elf(String),
    /// Captured bytes do not match the schema they were captured under.
    Decode(String),
    LibraryNotFound(String),
    SymbolNotFound(String),
    /// Attaching the named probe (`symbol@library`) failed for the boxed
    /// underlying reason.
    Attach(String, Box<Error>),
    /// Detaching the named probe failed. The probe slot is still retired.
    Detach(String, Box<Error>),
    Dispatch(String),
    Handler(String),
}

pub type Result<T> = ::std::result::Result<T, Error>;

impl From<::goblin::error::Error> for Error {
    fn from(e: ::goblin::error::Error) -> Error {
        Error::Parse(e)
    }
}

impl From<::std::ffi::NulError> for Error {
    fn from(_e: ::std::ffi::NulError) -> Error {
        Error::StringConversion
    }
}

impl From<::std::io::Error> for Error {
    fn from(e: ::std::io::Error) -> Error {
        Error::IO(e)
    }
}
