use std::{fmt, sync::Arc};

use crate::{BridgeError, BridgeResult, Marshaller, MarshallingError, TaggedValue};

bitflags::bitflags! {
    /// How a function value is asked to run. The empty set is the default
    /// fire-and-forget mode.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct FunctionFlags: u8 {
        /// Run on the calling thread and hand back the result.
        const CALL_SYNC = 1 << 0;
        /// Report a boundary error to the caller instead of logging it.
        const PROPAGATES_ERROR = 1 << 1;
        /// A newer throttled call supersedes this one if it has not
        /// started yet.
        const ALLOW_THROTTLING = 1 << 2;
    }
}

pub type CallResult = Result<Option<TaggedValue>, MarshallingError>;

/// A function value that can be called from either side of the boundary.
pub trait ValueFunction: Send + Sync {
    /// Calls the function with `parameters`. `Ok(None)` when the function
    /// produced no value, which is always the case for calls that were
    /// deferred.
    fn call(&self, flags: FunctionFlags, parameters: Vec<TaggedValue>) -> CallResult;

    /// The invocation modes this function honours on top of the default.
    fn capabilities(&self) -> FunctionFlags {
        FunctionFlags::empty()
    }

    /// Short description used when rendering the value.
    fn function_type(&self) -> &'static str;
}

/// Fails with `UnsupportedInvocationMode` when `requested` asks for a
/// mode the function does not declare.
pub fn check_invocation_mode(
    function: &dyn ValueFunction,
    requested: FunctionFlags,
) -> BridgeResult<()> {
    let supported = function.capabilities();
    if supported.contains(requested) {
        Ok(())
    } else {
        Err(BridgeError::UnsupportedInvocationMode {
            requested,
            supported,
        })
    }
}

/// Hands a callee's error to the caller when `flags` asks for
/// `PROPAGATES_ERROR`. Otherwise the error is logged and the call produces
/// no value.
pub fn propagate_or_log(
    function_type: &str,
    flags: FunctionFlags,
    result: CallResult,
) -> CallResult {
    match result {
        Err(error) if !flags.contains(FunctionFlags::PROPAGATES_ERROR) => {
            log::error!("uncaught error in {function_type}: {error}");
            Ok(None)
        }
        result => result,
    }
}

/// A native callable exposed as a function value. The callable receives
/// its arguments in a fresh marshaller and pushes at most one result.
pub struct MarshallerFunction<F> {
    name: &'static str,
    callable: F,
}

impl<F> MarshallerFunction<F>
where
    F: Fn(&mut Marshaller) -> BridgeResult<bool> + Send + Sync + 'static,
{
    pub fn new(name: &'static str, callable: F) -> Self {
        Self { name, callable }
    }

    pub fn into_value(self) -> TaggedValue {
        TaggedValue::make_function(Arc::new(self))
    }
}

impl<F> MarshallerFunction<F>
where
    F: Fn(&mut Marshaller) -> BridgeResult<bool> + Send + Sync + 'static,
{
    fn run(&self, parameters: Vec<TaggedValue>) -> BridgeResult<Option<TaggedValue>> {
        let arguments = parameters.len();
        let mut marshaller = Marshaller::from_values(parameters);
        let pushed = (self.callable)(&mut marshaller)?;
        marshaller.check_for_error()?;
        marshaller.take_result(arguments, pushed)
    }
}

impl<F> ValueFunction for MarshallerFunction<F>
where
    F: Fn(&mut Marshaller) -> BridgeResult<bool> + Send + Sync + 'static,
{
    fn call(&self, flags: FunctionFlags, parameters: Vec<TaggedValue>) -> CallResult {
        let result = self
            .run(parameters)
            .map_err(BridgeError::into_marshalling_error);
        propagate_or_log(self.name, flags, result)
    }

    fn capabilities(&self) -> FunctionFlags {
        FunctionFlags::CALL_SYNC | FunctionFlags::PROPAGATES_ERROR
    }

    fn function_type(&self) -> &'static str {
        self.name
    }
}

/// Native-side handle to a function value, whatever backs it.
#[derive(Clone)]
pub struct Invocable {
    function: Arc<dyn ValueFunction>,
}

impl Invocable {
    pub fn new(function: Arc<dyn ValueFunction>) -> Self {
        Self { function }
    }

    pub fn from_value(value: &TaggedValue) -> BridgeResult<Self> {
        value.get_function().map(Self::new)
    }

    pub fn function(&self) -> &Arc<dyn ValueFunction> {
        &self.function
    }

    /// Fire and forget. A boundary error has nobody to go back to and is
    /// logged.
    pub fn invoke(&self, parameters: Vec<TaggedValue>) {
        if let Err(error) = self.function.call(FunctionFlags::empty(), parameters) {
            log::error!(
                "uncaught error in {}: {error}",
                self.function.function_type()
            );
        }
    }

    /// Runs on the calling thread and returns the result or the error.
    pub fn invoke_sync(
        &self,
        parameters: Vec<TaggedValue>,
    ) -> BridgeResult<Option<TaggedValue>> {
        let flags = FunctionFlags::CALL_SYNC | FunctionFlags::PROPAGATES_ERROR;
        check_invocation_mode(self.function.as_ref(), flags)?;
        Ok(self.function.call(flags, parameters)?)
    }

    pub fn invoke_throttled(&self, parameters: Vec<TaggedValue>) -> BridgeResult<()> {
        let flags = FunctionFlags::ALLOW_THROTTLING;
        check_invocation_mode(self.function.as_ref(), flags)?;
        if let Err(error) = self.function.call(flags, parameters) {
            log::error!(
                "uncaught error in {}: {error}",
                self.function.function_type()
            );
        }
        Ok(())
    }

    /// Calls the function with every value of `marshaller`'s current frame
    /// as arguments. Pushes the result if there is one.
    pub fn perform(
        &self,
        marshaller: &mut Marshaller,
        flags: FunctionFlags,
    ) -> BridgeResult<bool> {
        let argument_count = marshaller.size();
        marshaller.call_value(&self.function, argument_count, flags)
    }
}

impl fmt::Debug for Invocable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invocable({})", self.function.function_type())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adder() -> Arc<dyn ValueFunction> {
        Arc::new(MarshallerFunction::new("add", |m: &mut Marshaller| {
            let sum = m.get_int(0)? + m.get_int(1)?;
            m.push_int(sum);
            Ok(true)
        }))
    }

    #[test]
    fn marshaller_function_returns_its_pushed_value() {
        let result = adder()
            .call(FunctionFlags::empty(), vec![2.into(), 3.into()])
            .unwrap();
        assert_eq!(result, Some(TaggedValue::Int(5)));
    }

    #[test]
    fn errors_surface_as_marshalling_errors() {
        let error = adder()
            .call(
                FunctionFlags::PROPAGATES_ERROR,
                vec![2.into(), "three".into()],
            )
            .unwrap_err();
        assert_eq!(error.message(), "expected a value of kind int, found string");
    }

    #[test]
    fn errors_reach_the_caller_only_when_propagated() {
        let modes = [
            (FunctionFlags::empty(), false),
            (FunctionFlags::CALL_SYNC, false),
            (FunctionFlags::PROPAGATES_ERROR, true),
            (FunctionFlags::CALL_SYNC | FunctionFlags::PROPAGATES_ERROR, true),
        ];
        for (flags, propagates) in modes {
            let result = adder().call(flags, vec![2.into(), "three".into()]);
            if propagates {
                assert!(result.is_err(), "{flags:?} should propagate");
            } else {
                assert_eq!(result, Ok(None), "{flags:?} should log");
            }
        }
    }

    #[test]
    fn declared_results_must_be_pushed_exactly_once() {
        let flags = FunctionFlags::CALL_SYNC | FunctionFlags::PROPAGATES_ERROR;
        let claims_a_result = MarshallerFunction::new("claims", |_m: &mut Marshaller| Ok(true));
        let error = claims_a_result
            .call(flags, vec!["argument".into()])
            .unwrap_err();
        assert_eq!(
            error.message(),
            "callable left 1 values in its frame, expected 2"
        );

        let pushes_two = MarshallerFunction::new("two", |m: &mut Marshaller| {
            m.push_int(1);
            m.push_int(2);
            Ok(true)
        });
        assert!(pushes_two.call(flags, vec![]).is_err());

        let silent = MarshallerFunction::new("silent", |m: &mut Marshaller| {
            m.push_int(1);
            Ok(false)
        });
        assert!(silent.call(flags, vec![]).is_err(), "undeclared result");
    }

    #[test]
    fn sync_invocation_propagates_errors() {
        let failing: Arc<dyn ValueFunction> =
            Arc::new(MarshallerFunction::new("fail", |m: &mut Marshaller| {
                m.set_pending_error(MarshallingError::new("bad input"));
                Ok(false)
            }));
        let invocable = Invocable::new(failing);
        assert_eq!(
            invocable.invoke_sync(vec![]),
            Err(BridgeError::Marshalling(MarshallingError::new("bad input")))
        );
    }

    #[test]
    fn throttling_requires_the_capability() {
        let invocable = Invocable::new(adder());
        assert_eq!(
            invocable.invoke_throttled(vec![]),
            Err(BridgeError::UnsupportedInvocationMode {
                requested: FunctionFlags::ALLOW_THROTTLING,
                supported: FunctionFlags::CALL_SYNC | FunctionFlags::PROPAGATES_ERROR,
            })
        );
        assert_eq!(
            invocable.invoke_sync(vec![1.into(), 1.into()]),
            Ok(Some(TaggedValue::Int(2)))
        );
    }

    #[test]
    fn perform_consumes_the_frame() {
        let mut marshaller = Marshaller::default();
        marshaller.push_int(20);
        marshaller.push_int(22);

        let pushed = Invocable::new(adder())
            .perform(&mut marshaller, FunctionFlags::CALL_SYNC)
            .unwrap();
        assert!(pushed);
        assert_eq!(marshaller.size(), 1);
        assert_eq!(marshaller.get_int(-1), Ok(42));
    }
}
