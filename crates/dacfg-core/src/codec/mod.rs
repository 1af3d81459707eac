//! Value Marshaler: conversion between [`TypedValue`](crate::TypedValue)s and
//! the textual [`RawValue`](crate::backend::RawValue)s backends persist.

pub mod marshal;

pub use marshal::{decode, decode_as, encode, encode_as, MarshalError};
