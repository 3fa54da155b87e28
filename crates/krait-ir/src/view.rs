//! Read views over an [`IrFunction`].
//!
//! Compilation in place borrows the builder's arenas directly; handing IR to
//! a background compiler (or persisting it) takes a deep copy. Both cases
//! present the same read-only surface.

use crate::arena::IrFunction;

#[derive(Debug)]
pub enum IrListView<'a> {
    /// Zero-copy alias of the builder's arenas.
    Borrowed(&'a IrFunction),
    /// Deep copy owned by the consumer (e.g. the compile service worker).
    Owned(Box<IrFunction>),
}

impl<'a> IrListView<'a> {
    #[must_use]
    pub fn borrowed(func: &'a IrFunction) -> Self {
        IrListView::Borrowed(func)
    }

    /// Deep-copy `func` so the view outlives the builder.
    #[must_use]
    pub fn copied(func: &IrFunction) -> IrListView<'static> {
        IrListView::Owned(Box::new(func.clone()))
    }

    #[must_use]
    pub fn get(&self) -> &IrFunction {
        match self {
            IrListView::Borrowed(f) => f,
            IrListView::Owned(f) => f,
        }
    }

    #[must_use]
    pub fn into_owned(self) -> IrFunction {
        match self {
            IrListView::Borrowed(f) => f.clone(),
            IrListView::Owned(f) => *f,
        }
    }
}

impl std::ops::Deref for IrListView<'_> {
    type Target = IrFunction;

    fn deref(&self) -> &IrFunction {
        self.get()
    }
}
