/*!
# OpenCitations Table Editor

Browser-based correction of bibliographic CSV tables that failed validation.

## Overview

A user uploads a metadata table, a citations table, or both. An external
validator checks them and an external renderer turns each CSV plus its issue
report into an HTML table. From then on that HTML document is the single
source of truth: every edit is applied to it, it is parsed back into rows for
export, and it is re-serialized to CSV whenever the user asks to revalidate.

## Architecture

### Document layer
- **Markup** - A small arena HTML tree with id and class lookup
- **Document model** - Row, cell and item addressing on top of the tree
  (`row{N}`, `{row}-{field}-{index}`)
- **Field table** - Which fields hold several values and how they are joined

### Editing layer
- **Mutation engine** - Set, append, remove, clear cell, delete and add row
- **Deletion diff** - Baseline vs current comparison and ghost overlays
- **Tracking** - Edited values plus added/deleted rows and items
- **History** - Bounded per-table undo/redo over snapshot triples

### Session layer
- **Session store** - One directory of JSON and HTML artifacts per session
- **Revalidation** - CSV serialization, external validation, rendering and
  merging, committed only when every step succeeded
- **Archives** - Gzip-compressed bincode bundles of a whole session

## Modules

- `markup` - HTML parsing, querying and serialization
- `document` - Table document addressing and presentation classes
- `fields` - Multi-value field separators
- `codec` - Document to rows, rows to CSV, delimiter sniffing
- `mutation` - Atomic document operations
- `diff` - Deletion tracking and ghost overlays
- `tracking` - Edit and change logs
- `history` - Undo/redo stacks
- `session` - Session descriptor and file-backed store
- `collaborators` - Validator, renderer and merger interfaces
- `revalidate` - Validation pipeline
- `saving` - Session archives
- `editor` - Session-scoped facade used by the web layer
- `app` - HTTP routes (feature `web`)

## REST API Endpoints

- `/api/upload/` - Upload CSVs and run the initial validation
- `/api/edit/html/{session}` - Current document with overlays and highlights
- `/api/edit/item`, `/api/edit/append`, `/api/edit/remove-item` - Item edits
- `/api/edit/clear-cell`, `/api/edit/delete-row`, `/api/edit/add-row` - Structural edits
- `/api/edit/undo`, `/api/edit/redo` - History
- `/api/edit/revalidate` - Validate the edited tables again
- `/api/export/{session}` - Download the edited CSV
- `/api/draft/save`, `/api/draft/list`, `/api/draft/load` - Drafts and archives
*/

pub mod codec;
pub mod collaborators;
pub mod config;
pub mod diff;
pub mod document;
pub mod editor;
pub mod error;
pub mod fields;
pub mod history;
pub mod markup;
pub mod mutation;
pub mod revalidate;
pub mod saving;
pub mod session;
pub mod tracking;

#[cfg(feature = "web")]
pub mod app;

pub use config::{EditTrackingPolicy, EditorConfig};
pub use document::{ItemId, RowId, TableDocument};
pub use editor::Editor;
pub use error::{EditorError, Result};
pub use session::{FileSessionStore, SessionStore, TableKind};
