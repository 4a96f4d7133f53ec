//! Accessor generation for the little-endian wrapper fields of the
//! persisted records in `database::layout` and `index`.

/// Generates a `field()` getter and a `set_field()` setter for a zerocopy
/// `U32` or `U64` struct field.
///
/// ```ignore
/// impl HeaderBlock {
///     zerocopy_accessors! {
///         size: u64,
///         root: u64,
///     }
/// }
/// ```
#[macro_export]
macro_rules! zerocopy_accessors {
    ($($field:ident : $ty:tt),* $(,)?) => {
        $($crate::zerocopy_accessors!(@one $field, $ty);)*
    };
    (@one $field:ident, u32) => {
        $crate::zerocopy_accessors!(@emit $field, u32, ::zerocopy::little_endian::U32);
    };
    (@one $field:ident, u64) => {
        $crate::zerocopy_accessors!(@emit $field, u64, ::zerocopy::little_endian::U64);
    };
    (@emit $field:ident, $native:ty, $wrapper:ty) => {
        ::paste::paste! {
            #[inline]
            pub fn $field(&self) -> $native {
                self.$field.get()
            }

            #[inline]
            pub fn [<set_ $field>](&mut self, value: $native) {
                self.$field = <$wrapper>::new(value);
            }
        }
    };
}

/// Getter-only variant for records that are never mutated in place once
/// written (the file header and trailers).
#[macro_export]
macro_rules! zerocopy_getters {
    ($($field:ident : $native:ty),* $(,)?) => {
        $(
            #[inline]
            pub fn $field(&self) -> $native {
                self.$field.get()
            }
        )*
    };
}
