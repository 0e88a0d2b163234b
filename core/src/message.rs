//! Contracts consumed from the external message runtime.
//!
//! The framework moves opaque payload bytes; what gives them shape is a
//! schema runtime supplied by the embedder. It is consumed through three
//! capabilities: a [`Message`] that can parse itself from bytes and render
//! itself back, a [`ServiceDescriptor`] enumerating methods by name, and a
//! [`Service`] that can mint request/response prototypes and run a method.

use std::any::Any;

/// A schema-described payload.
pub trait Message: Send + 'static {
    /// Replace the contents of `self` with the decoded `buf`.
    fn merge_from(&mut self, buf: &[u8]) -> Result<(), ()>;

    fn to_bytes(&self) -> Vec<u8>;

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// One method of a service, identified by name.
pub struct MethodDescriptor {
    name: String,
    index: usize,
}

impl MethodDescriptor {
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }
}

/// Static description of a service: its full name and its methods.
pub struct ServiceDescriptor {
    full_name: String,
    methods: Vec<MethodDescriptor>,
}

impl ServiceDescriptor {
    pub fn new(full_name: &str, methods: &[&str]) -> Self {
        Self {
            full_name: full_name.to_string(),
            methods: methods
                .iter()
                .enumerate()
                .map(|(index, name)| MethodDescriptor { name: name.to_string(), index })
                .collect(),
        }
    }

    #[inline]
    pub fn full_name(&self) -> &str {
        &self.full_name
    }

    pub fn find_method(&self, name: &str) -> Option<&MethodDescriptor> {
        self.methods.iter().find(|m| m.name == name)
    }
}

/// Continuation handed to [`Service::call_method`]; invoke it with the
/// filled response when the method is done. It may run on any thread.
pub type ServeDone = Box<dyn FnOnce(Box<dyn Message>) + Send>;

/// A user-provided service implementation.
pub trait Service: Send + Sync + 'static {
    fn descriptor(&self) -> &ServiceDescriptor;

    /// A fresh, default-initialized request payload for `method`.
    fn request_prototype(&self, method: &MethodDescriptor) -> Box<dyn Message>;

    /// A fresh, default-initialized response payload for `method`.
    fn response_prototype(&self, method: &MethodDescriptor) -> Box<dyn Message>;

    /// Run `method`. The implementation owns `request` and `response` and
    /// must eventually call `done(response)` exactly once, on whatever
    /// thread it likes.
    fn call_method(
        &self, method: &MethodDescriptor, request: Box<dyn Message>, response: Box<dyn Message>,
        done: ServeDone,
    );
}
