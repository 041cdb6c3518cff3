use anyhow::anyhow;
use tracing::trace;

use crate::datastore::find_by_id;
use crate::model::{
  AssetGroup,
  ItemKind,
  Priority,
  ScheduleItem,
  StopStatus
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pred {
  Kind(ItemKind),
  PriorityEq(Priority),
  StatusEq(StopStatus),
  Asset(u64),
  Site(String),
  Area(String),
  TextContains(String)
}

impl Pred {
  /// Whether the predicate can be
  /// evaluated against an asset group.
  pub fn applies_to_assets(
    &self
  ) -> bool {
    matches!(
      self,
      Pred::Asset(_)
        | Pred::Site(_)
        | Pred::Area(_)
        | Pred::TextContains(_)
    )
  }
}

/// Disjunction of conjunctions: terms
/// are AND-ed, `or` starts a new group.
#[derive(Debug, Clone, Default)]
pub struct Filter {
  groups: Vec<Vec<Pred>>
}

impl Filter {
  #[tracing::instrument(skip(terms))]
  pub fn parse(
    terms: &[String]
  ) -> anyhow::Result<Self> {
    let mut groups = vec![];
    let mut current = vec![];

    for term in terms {
      let token = term.trim();
      if token.is_empty() {
        continue;
      }
      if token.eq_ignore_ascii_case("or")
        || token == "||"
      {
        if current.is_empty() {
          return Err(anyhow!(
            "filter: 'or' needs a term \
             on both sides"
          ));
        }
        groups.push(std::mem::take(
          &mut current
        ));
        continue;
      }
      if token.eq_ignore_ascii_case("and")
        || token == "&&"
      {
        continue;
      }
      current.push(parse_atom(token)?);
    }

    if !current.is_empty() {
      groups.push(current);
    } else if !groups.is_empty() {
      return Err(anyhow!(
        "filter: trailing 'or'"
      ));
    }

    trace!(?groups, "parsed filter");
    Ok(Self {
      groups
    })
  }

  pub fn is_empty(&self) -> bool {
    self.groups.is_empty()
  }

  pub fn applies_to_assets(
    &self
  ) -> bool {
    self
      .groups
      .iter()
      .flatten()
      .all(Pred::applies_to_assets)
  }

  pub fn matches(
    &self,
    item: &ScheduleItem,
    assets: &[AssetGroup]
  ) -> bool {
    self.any_group(|pred| {
      eval_item(pred, item, assets)
    })
  }

  pub fn matches_asset(
    &self,
    asset: &AssetGroup
  ) -> bool {
    self.any_group(|pred| {
      eval_asset(pred, asset)
    })
  }

  fn any_group<F>(
    &self,
    eval: F
  ) -> bool
  where
    F: Fn(&Pred) -> bool
  {
    if self.groups.is_empty() {
      return true;
    }
    self.groups.iter().any(|group| {
      group.iter().all(&eval)
    })
  }
}

fn parse_atom(
  token: &str
) -> anyhow::Result<Pred> {
  let Some((key, value)) =
    token.split_once(':')
  else {
    return Ok(Pred::TextContains(
      token.to_lowercase()
    ));
  };

  let value = value.trim();
  match key.to_ascii_lowercase().as_str()
  {
    | "kind" | "type" => {
      Ok(Pred::Kind(value.parse()?))
    }
    | "pri" | "priority" => {
      Ok(Pred::PriorityEq(value.parse()?))
    }
    | "status" => {
      Ok(Pred::StatusEq(value.parse()?))
    }
    | "asset" | "assets" => {
      let id = value.parse().map_err(
        |_| {
          anyhow!(
            "filter: invalid asset id: \
             {value}"
          )
        }
      )?;
      Ok(Pred::Asset(id))
    }
    | "site" => {
      Ok(Pred::Site(value.to_lowercase()))
    }
    | "area" => {
      Ok(Pred::Area(value.to_lowercase()))
    }
    | _ => {
      Ok(Pred::TextContains(
        token.to_lowercase()
      ))
    }
  }
}

fn eval_item(
  pred: &Pred,
  item: &ScheduleItem,
  assets: &[AssetGroup]
) -> bool {
  match pred {
    | Pred::Kind(kind) => {
      item.kind == *kind
    }
    | Pred::PriorityEq(priority) => {
      item.priority == Some(*priority)
    }
    | Pred::StatusEq(status) => {
      item.status.as_deref()
        == Some(status.as_str())
    }
    | Pred::Asset(id) => {
      item.asset_groups.contains(id)
    }
    | Pred::Site(site) => {
      linked_assets(item, assets).any(|asset| {
        asset.site.to_lowercase() == *site
      })
    }
    | Pred::Area(area) => {
      linked_assets(item, assets).any(|asset| {
        asset.area.to_lowercase() == *area
      })
    }
    | Pred::TextContains(text) => {
      item
        .name
        .to_lowercase()
        .contains(text.as_str())
    }
  }
}

fn linked_assets<'a>(
  item: &'a ScheduleItem,
  assets: &'a [AssetGroup]
) -> impl Iterator<Item = &'a AssetGroup>
{
  item.asset_groups.iter().filter_map(
    move |id| find_by_id(assets, *id)
  )
}

fn eval_asset(
  pred: &Pred,
  asset: &AssetGroup
) -> bool {
  match pred {
    | Pred::Asset(id) => asset.id == *id,
    | Pred::Site(site) => {
      asset.site.to_lowercase() == *site
    }
    | Pred::Area(area) => {
      asset.area.to_lowercase() == *area
    }
    | Pred::TextContains(text) => {
      asset
        .name
        .to_lowercase()
        .contains(text.as_str())
    }
    | Pred::Kind(_)
    | Pred::PriorityEq(_)
    | Pred::StatusEq(_) => false
  }
}
