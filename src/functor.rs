//! Type-erased bound methods.
//!
//! Any `Fn(P1, .., Pn) -> R` (n <= 6) or `Fn(&CallContext, P1, .., Pn) -> R` whose
//! parameters are [`ValueType`]s becomes one [`BoundMethod`], the single generic
//! dispatch path. The erased [`Functor`] marshals a `Value` parameter array into the
//! native tuple, and also exposes the native closure so same-process callers can skip
//! marshalling altogether.

use std::any::Any;
use std::sync::Arc;

use crate::context::CallContext;
use crate::value::{Binary, TypeTag, Value, ValueType};
use crate::{BrokerError, Result};

/// Upper bound on bound method arity.
pub const MAX_ARITY: usize = 6;

/// Native closure stored by a [`BoundMethod`].
pub type NativeFn<A, T> = Arc<dyn Fn(&CallContext, A) -> Result<T> + Send + Sync>;

/// Tuple of method parameters.
pub trait Args: Sized + Send + 'static {
    const ARITY: usize;

    fn tags() -> Vec<TypeTag>;

    fn from_params(params: &Value) -> Result<Self>;

    fn into_params(self) -> Value;
}

fn param_slice(params: &Value, arity: usize) -> Result<&[Value]> {
    let items: &[Value] = match params {
        Value::Array(items) => items,
        Value::Invalid => &[],
        other => {
            return Err(BrokerError::TypeMismatch(format!(
                "parameters must be an array, found {}",
                other.kind()
            )))
        }
    };
    if items.len() != arity {
        return Err(BrokerError::ArityMismatch(format!(
            "expected {} parameters, got {}",
            arity,
            items.len()
        )));
    }
    Ok(items)
}

fn param_error(index: usize, err: BrokerError) -> BrokerError {
    match err {
        BrokerError::TypeMismatch(msg) => {
            BrokerError::TypeMismatch(format!("parameter #{}: {}", index + 1, msg))
        }
        other => other,
    }
}

macro_rules! impl_args {
    ($n:expr; $($idx:tt $P:ident $p:ident),*) => {
        impl<$($P: ValueType),*> Args for ($($P,)*) {
            const ARITY: usize = $n;

            fn tags() -> Vec<TypeTag> {
                vec![$($P::TAG),*]
            }

            #[allow(unused_variables)]
            fn from_params(params: &Value) -> Result<Self> {
                let items = param_slice(params, $n)?;
                Ok(($($P::from_value(&items[$idx]).map_err(|e| param_error($idx, e))?,)*))
            }

            fn into_params(self) -> Value {
                let ($($p,)*) = self;
                Value::Array(vec![$($p.into_value()),*])
            }
        }
    };
}

impl_args!(0;);
impl_args!(1; 0 P1 p1);
impl_args!(2; 0 P1 p1, 1 P2 p2);
impl_args!(3; 0 P1 p1, 1 P2 p2, 2 P3 p3);
impl_args!(4; 0 P1 p1, 1 P2 p2, 2 P3 p3, 3 P4 p4);
impl_args!(5; 0 P1 p1, 1 P2 p2, 2 P3 p3, 3 P4 p4, 4 P5 p5);
impl_args!(6; 0 P1 p1, 1 P2 p2, 2 P3 p3, 3 P4 p4, 4 P5 p5, 5 P6 p6);

/// Value part of a method result: `()` for void methods.
pub trait ReturnValue: Sized + Send + 'static {
    const TAG: TypeTag;

    fn into_return(self) -> Value;

    /// Converts a call result; `None` means the callee is void.
    fn from_return(value: Option<Value>) -> Result<Self>;
}

/// What a bound method may return: a value, `()`, or `Result<value, BrokerError>`.
pub trait MethodReturn: Send + 'static {
    type Output: ReturnValue;

    fn into_output(self) -> Result<Self::Output>;
}

impl ReturnValue for () {
    const TAG: TypeTag = TypeTag::Void;

    fn into_return(self) -> Value {
        Value::Invalid
    }

    fn from_return(_value: Option<Value>) -> Result<Self> {
        Ok(())
    }
}

impl MethodReturn for () {
    type Output = ();

    fn into_output(self) -> Result<()> {
        Ok(())
    }
}

fn value_from_return<T: ValueType>(value: Option<Value>) -> Result<T> {
    match value {
        Some(v) => T::from_value(&v),
        None => Err(BrokerError::TypeMismatch(format!(
            "method returns void, {} was requested",
            T::TAG
        ))),
    }
}

macro_rules! impl_return {
    ($($t:ty),*) => {
        $(
            impl ReturnValue for $t {
                const TAG: TypeTag = <$t as ValueType>::TAG;

                fn into_return(self) -> Value {
                    self.into_value()
                }

                fn from_return(value: Option<Value>) -> Result<Self> {
                    value_from_return(value)
                }
            }

            impl MethodReturn for $t {
                type Output = $t;

                fn into_output(self) -> Result<$t> {
                    Ok(self)
                }
            }
        )*
    };
}

impl_return!(bool, i32, i64, f32, f64, String, Binary, Value);

impl<T: ValueType> ReturnValue for Vec<T> {
    const TAG: TypeTag = TypeTag::Array;

    fn into_return(self) -> Value {
        self.into_value()
    }

    fn from_return(value: Option<Value>) -> Result<Self> {
        value_from_return(value)
    }
}

impl<T: ValueType> MethodReturn for Vec<T> {
    type Output = Vec<T>;

    fn into_output(self) -> Result<Vec<T>> {
        Ok(self)
    }
}

impl<T: ReturnValue> MethodReturn for Result<T> {
    type Output = T;

    fn into_output(self) -> Result<T> {
        self
    }
}

/// Type-erased bound method.
pub trait Functor: Send + Sync {
    fn arity(&self) -> usize;

    fn param_tags(&self) -> Vec<TypeTag>;

    fn return_tag(&self) -> TypeTag;

    /// Unpacks `params`, invokes the method and packs the result
    /// (`Value::Invalid` for void methods).
    fn call(&self, ctx: &CallContext, params: &Value) -> Result<Value>;

    /// The stored [`NativeFn`], for same-process typed calls.
    fn native(&self) -> &(dyn Any + Send + Sync);
}

/// The one concrete functor: a native closure over a parameter tuple.
pub struct BoundMethod<A, T> {
    f: NativeFn<A, T>,
}

impl<A: Args, T: ReturnValue> BoundMethod<A, T> {
    pub fn new(f: NativeFn<A, T>) -> Self {
        Self { f }
    }
}

impl<A: Args, T: ReturnValue> Functor for BoundMethod<A, T> {
    fn arity(&self) -> usize {
        A::ARITY
    }

    fn param_tags(&self) -> Vec<TypeTag> {
        A::tags()
    }

    fn return_tag(&self) -> TypeTag {
        T::TAG
    }

    fn call(&self, ctx: &CallContext, params: &Value) -> Result<Value> {
        let args = A::from_params(params)?;
        (self.f)(ctx, args).map(ReturnValue::into_return)
    }

    fn native(&self) -> &(dyn Any + Send + Sync) {
        &self.f
    }
}

/// Calls the native closure when its signature is exactly `(A) -> T`;
/// hands the arguments back otherwise.
pub fn invoke_native<A: Args, T: ReturnValue>(
    functor: &dyn Functor,
    ctx: &CallContext,
    args: A,
) -> std::result::Result<Result<T>, A> {
    match functor.native().downcast_ref::<NativeFn<A, T>>() {
        Some(f) => Ok(f(ctx, args)),
        None => Err(args),
    }
}

/// Plain closures that can be bound as methods.
pub trait Method<A, R>: Send + Sync + 'static {
    fn into_functor(self) -> Arc<dyn Functor>;
}

/// Closures taking the [`CallContext`] as first parameter.
pub trait ContextMethod<A, R>: Send + Sync + 'static {
    fn into_functor(self) -> Arc<dyn Functor>;
}

macro_rules! impl_method {
    ($($P:ident $p:ident),*) => {
        impl<F, R, $($P),*> Method<($($P,)*), R> for F
        where
            F: Fn($($P),*) -> R + Send + Sync + 'static,
            R: MethodReturn,
            $($P: ValueType,)*
        {
            fn into_functor(self) -> Arc<dyn Functor> {
                let f: NativeFn<($($P,)*), R::Output> =
                    Arc::new(move |_ctx: &CallContext, ($($p,)*): ($($P,)*)| (self)($($p),*).into_output());
                Arc::new(BoundMethod::new(f))
            }
        }

        impl<F, R, $($P),*> ContextMethod<($($P,)*), R> for F
        where
            F: Fn(&CallContext, $($P),*) -> R + Send + Sync + 'static,
            R: MethodReturn,
            $($P: ValueType,)*
        {
            fn into_functor(self) -> Arc<dyn Functor> {
                let f: NativeFn<($($P,)*), R::Output> =
                    Arc::new(move |ctx: &CallContext, ($($p,)*): ($($P,)*)| (self)(ctx, $($p),*).into_output());
                Arc::new(BoundMethod::new(f))
            }
        }
    };
}

impl_method!();
impl_method!(P1 p1);
impl_method!(P1 p1, P2 p2);
impl_method!(P1 p1, P2 p2, P3 p3);
impl_method!(P1 p1, P2 p2, P3 p3, P4 p4);
impl_method!(P1 p1, P2 p2, P3 p3, P4 p4, P5 p5);
impl_method!(P1 p1, P2 p2, P3 p3, P4 p4, P5 p5, P6 p6);
