/// Declare a strongly-typed id over a primitive.
///
/// Ids from different namespaces (file, chunk, version, write) must not
/// mix at compile time, but on the wire and on disk they are bare
/// numbers. The generated newtype is `#[repr(transparent)]` with
/// transparent serde, derefs to the primitive, and formats as the raw
/// value (`Display`) or as `Name(value)` (`Debug`).
///
/// A trailing block declares named values of the id's domain:
///
/// ```
/// use nimbus_types::strong_type;
/// strong_type!(Generation, u32, {
///     /// Generation of a slot that was never reused.
///     INITIAL = 0;
/// });
/// assert_eq!(Generation::INITIAL, Generation(0));
/// ```
#[macro_export]
macro_rules! strong_type {
    ($name:ident, $inner:ty) => {
        $crate::strong_type!(@define $name, $inner);
    };
    ($name:ident, $inner:ty, { $( $(#[$meta:meta])* $konst:ident = $value:expr; )+ }) => {
        $crate::strong_type!(@define $name, $inner);

        impl $name {
            $(
                $(#[$meta])*
                pub const $konst: $name = $name($value);
            )+
        }
    };
    (@define $name:ident, $inner:ty) => {
        #[derive(
            Clone,
            Copy,
            PartialEq,
            Eq,
            Hash,
            PartialOrd,
            Ord,
            Default,
            serde::Serialize,
            serde::Deserialize,
        )]
        #[serde(transparent)]
        #[repr(transparent)]
        pub struct $name(pub $inner);

        impl $name {
            /// The wrapped raw value.
            #[inline]
            pub const fn raw(self) -> $inner {
                self.0
            }
        }

        impl ::std::ops::Deref for $name {
            type Target = $inner;

            #[inline]
            fn deref(&self) -> &Self::Target {
                &self.0
            }
        }

        impl From<$inner> for $name {
            #[inline]
            fn from(raw: $inner) -> Self {
                Self(raw)
            }
        }

        impl From<$name> for $inner {
            #[inline]
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl ::std::fmt::Debug for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                f.debug_tuple(stringify!($name)).field(&self.0).finish()
            }
        }

        impl ::std::fmt::Display for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                ::std::fmt::Display::fmt(&self.0, f)
            }
        }
    };
}
